use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use fittrack_core::meal_plans::DataSource;
use fittrack_core::models::{DayOfWeek, MacroSnapshot, MealPlan, Provenance};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// Per-100-unit macros from the optional `--calories/--protein/--carbs/--fat` flags.
/// All four are needed when any is given.
pub(crate) fn parse_macros_per_100(
    calories: Option<f64>,
    protein: Option<f64>,
    carbs: Option<f64>,
    fat: Option<f64>,
) -> Result<Option<MacroSnapshot>> {
    match (calories, protein, carbs, fat) {
        (None, None, None, None) => Ok(None),
        (Some(calories), Some(protein_g), Some(carbohydrates_g), Some(fat_g)) => {
            if [calories, protein_g, carbohydrates_g, fat_g]
                .iter()
                .any(|v| *v < 0.0 || !v.is_finite())
            {
                bail!("Macro values must be non-negative numbers");
            }
            Ok(Some(MacroSnapshot {
                calories,
                protein_g,
                carbohydrates_g,
                fat_g,
            }))
        }
        _ => bail!(
            "If giving macros, all four (--calories, --protein, --carbs, --fat) must be provided"
        ),
    }
}

pub(crate) fn source_note(source: DataSource) {
    if source == DataSource::Local {
        eprintln!("Server unreachable, showing data saved on this device.");
    }
}

pub(crate) fn print_plan_table(plans: &[MealPlan]) {
    #[derive(Tabled)]
    struct PlanRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Active")]
        active: String,
        #[tabled(rename = "Items")]
        items: usize,
        #[tabled(rename = "Target kcal")]
        calories: String,
        #[tabled(rename = "Saved")]
        saved: String,
    }

    let rows: Vec<PlanRow> = plans
        .iter()
        .map(|p| PlanRow {
            id: p.id.to_string(),
            name: truncate(&p.name, 35),
            active: if p.is_active { "yes" } else { "" }.to_string(),
            items: p.items.len(),
            calories: fmt_opt(p.target_calories, 0),
            saved: match p.provenance() {
                Provenance::Local => "local",
                Provenance::Remote => "server",
            }
            .to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_plan_detail(plan: &MealPlan) {
    println!("{} ({})", plan.name, plan.id);
    if let Some(d) = &plan.description {
        println!("  {d}");
    }
    println!(
        "  Targets: {} kcal | P: {}g | C: {}g | F: {}g",
        fmt_opt(plan.target_calories, 0),
        fmt_opt(plan.target_protein_g, 0),
        fmt_opt(plan.target_carbs_g, 0),
        fmt_opt(plan.target_fat_g, 0),
    );
    if plan.id.is_local() {
        println!("  Saved on this device only. Run `fittrack plan sync` to upload.");
    }

    if plan.items.is_empty() {
        println!("\n  No items yet. Use `fittrack plan add-item` to add one.");
        return;
    }

    #[derive(Tabled)]
    struct ItemRow {
        #[tabled(rename = "Day")]
        day: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Ref")]
        meal_ref: String,
        #[tabled(rename = "Qty")]
        quantity: String,
        #[tabled(rename = "Cal")]
        calories: String,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fat: String,
    }

    let mut items: Vec<_> = plan.items.iter().collect();
    items.sort_by_key(|i| (i.day_of_week, i.meal_type));
    let rows: Vec<ItemRow> = items
        .into_iter()
        .map(|i| ItemRow {
            day: i.day_of_week.to_string(),
            meal: i.meal_type.to_string(),
            meal_ref: truncate(i.meal_name.as_deref().unwrap_or(&i.meal_id), 30),
            quantity: format!("{}{}", i.quantity, i.unit),
            calories: i.macros.map_or("-".into(), |m| format!("{:.0}", m.calories)),
            protein: i.macros.map_or("-".into(), |m| format!("{:.1}", m.protein_g)),
            carbs: i
                .macros
                .map_or("-".into(), |m| format!("{:.1}", m.carbohydrates_g)),
            fat: i.macros.map_or("-".into(), |m| format!("{:.1}", m.fat_g)),
        })
        .collect();

    println!();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..8)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_week_table(plan: &MealPlan) {
    #[derive(Tabled)]
    struct DayRow {
        #[tabled(rename = "Day")]
        day: String,
        #[tabled(rename = "Calories")]
        calories: String,
        #[tabled(rename = "Protein")]
        protein: String,
        #[tabled(rename = "Carbs")]
        carbs: String,
        #[tabled(rename = "Fat")]
        fat: String,
    }

    let totals = plan.week_totals();
    let rows: Vec<DayRow> = DayOfWeek::ALL
        .iter()
        .zip(totals.iter())
        .map(|(day, t)| DayRow {
            day: day.to_string(),
            calories: format!("{:.0}", no_neg_zero(t.calories)),
            protein: format!("{:.1}g", no_neg_zero(t.protein_g)),
            carbs: format!("{:.1}g", no_neg_zero(t.carbohydrates_g)),
            fat: format!("{:.1}g", no_neg_zero(t.fat_g)),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    v.map_or("-".into(), |v| format!("{v:.decimals$}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
