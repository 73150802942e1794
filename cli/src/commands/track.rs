use anyhow::{Result, bail};
use chrono::NaiveDate;

use fittrack_core::meal_plans::{MealPlanRemote, MealPlanService};
use fittrack_core::models::{EntityId, MealPlan, MealType};
use fittrack_core::storage::KeyValueStore;
use fittrack_core::tracking::{CompletedMeal, DailyTracker};

use super::helpers::{fmt_opt, no_neg_zero, parse_date, truncate};

fn completed_meal(meal: &str, meal_id: &str) -> Result<CompletedMeal> {
    if meal_id.trim().is_empty() {
        bail!("Meal reference must not be empty");
    }
    Ok(CompletedMeal {
        meal_type: MealType::parse(meal)?,
        meal_id: meal_id.trim().to_string(),
    })
}

pub(crate) fn cmd_track_done<S: KeyValueStore>(
    tracker: &DailyTracker<S>,
    meal: &str,
    meal_id: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let entry = completed_meal(meal, meal_id)?;
    let added = tracker.mark_done(date, entry.clone())?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "date": date, "meal": entry, "added": added })
        );
    } else if added {
        println!("Marked {} {} done for {date}", entry.meal_type, entry.meal_id);
    } else {
        eprintln!("{} {} was already marked for {date}", entry.meal_type, entry.meal_id);
    }
    Ok(())
}

pub(crate) fn cmd_track_undo<S: KeyValueStore>(
    tracker: &DailyTracker<S>,
    meal: &str,
    meal_id: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let entry = completed_meal(meal, meal_id)?;
    let removed = tracker.undo(date, &entry)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "date": date, "meal": entry, "removed": removed })
        );
    } else if removed {
        println!("Unmarked {} {} for {date}", entry.meal_type, entry.meal_id);
    } else {
        eprintln!("{} {} was not marked for {date}", entry.meal_type, entry.meal_id);
    }
    Ok(())
}

pub(crate) fn cmd_track_note<S: KeyValueStore>(
    tracker: &DailyTracker<S>,
    text: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    tracker.set_note(date, text)?;
    let note = tracker.note(date)?;

    if json {
        println!("{}", serde_json::json!({ "date": date, "note": note }));
    } else if note.is_some() {
        println!("Saved note for {date}");
    } else {
        println!("Cleared note for {date}");
    }
    Ok(())
}

pub(crate) fn cmd_track_notes<S: KeyValueStore>(
    tracker: &DailyTracker<S>,
    json: bool,
) -> Result<()> {
    let mut notes = Vec::new();
    for date in tracker.noted_dates()? {
        if let Some(note) = tracker.note(date)? {
            notes.push((date, note));
        }
    }

    if json {
        let entries: Vec<_> = notes
            .iter()
            .map(|(date, note)| serde_json::json!({ "date": date, "note": note }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if notes.is_empty() {
        eprintln!("No notes yet. Use `fittrack track note` to add one.");
    }
    for (date, note) in &notes {
        println!("{date}  {}", truncate(note, 70));
    }
    Ok(())
}

/// The plan to track against: the one named, else the first active plan.
async fn resolve_plan<R: MealPlanRemote, S: KeyValueStore>(
    svc: &MealPlanService<R, S>,
    plan_id: Option<&str>,
) -> Result<MealPlan> {
    if let Some(id) = plan_id {
        return svc.get_by_id(&EntityId::parse(id)).await;
    }
    let list = svc.get_all(Some(true)).await?;
    match list.plans.into_iter().next() {
        Some(plan) => Ok(plan),
        None => bail!("No active meal plan. Pass --plan or mark a plan active."),
    }
}

pub(crate) async fn cmd_track_show<R: MealPlanRemote, S: KeyValueStore, T: KeyValueStore>(
    svc: &MealPlanService<R, S>,
    tracker: &DailyTracker<T>,
    plan_id: Option<&str>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date: NaiveDate = parse_date(date)?;
    let plan = resolve_plan(svc, plan_id).await?;
    let progress = tracker.progress(&plan, date)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    println!("{} ({}) | {}", date.format("%A, %B %-d, %Y"), progress.day, plan.name);
    println!("{}", "-".repeat(50));
    println!(
        "Planned:   {:.0} kcal | P: {:.1}g | C: {:.1}g | F: {:.1}g",
        no_neg_zero(progress.planned.calories),
        no_neg_zero(progress.planned.protein_g),
        no_neg_zero(progress.planned.carbohydrates_g),
        no_neg_zero(progress.planned.fat_g),
    );
    println!(
        "Eaten:     {:.0} kcal | P: {:.1}g | C: {:.1}g | F: {:.1}g",
        no_neg_zero(progress.eaten.calories),
        no_neg_zero(progress.eaten.protein_g),
        no_neg_zero(progress.eaten.carbohydrates_g),
        no_neg_zero(progress.eaten.fat_g),
    );
    println!(
        "Target:    {} kcal | remaining {}",
        fmt_opt(progress.target_calories, 0),
        fmt_opt(progress.remaining_calories, 0)
    );

    if !progress.completed.is_empty() {
        println!("\nDone:");
        for m in &progress.completed {
            println!("  [x] {} {}", m.meal_type, m.meal_id);
        }
    }
    if let Some(note) = &progress.note {
        println!("\nNote: {note}");
    }
    Ok(())
}
