use anyhow::{Result, bail};

use fittrack_core::meal_plans::{DataSource, MealPlanList, MealPlanRemote, MealPlanService};
use fittrack_core::models::{
    DayOfWeek, EntityId, MacroSnapshot, MealPlanItem, MealType, NewMealPlan, UpdateMealPlan,
};
use fittrack_core::storage::KeyValueStore;

use super::helpers::{
    json_error, print_plan_detail, print_plan_table, print_week_table, source_note,
};

type Service<R, S> = MealPlanService<R, S>;

pub(crate) async fn cmd_plan_list<R: MealPlanRemote, S: KeyValueStore>(
    svc: &Service<R, S>,
    active: Option<bool>,
    offline: bool,
    json: bool,
) -> Result<()> {
    let list = if offline {
        let plans = svc
            .cached()?
            .into_iter()
            .filter(|p| active.is_none_or(|a| p.is_active == a))
            .collect();
        MealPlanList {
            plans,
            source: DataSource::Local,
        }
    } else {
        svc.get_all(active).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    source_note(list.source);
    if list.plans.is_empty() {
        eprintln!("No meal plans found. Use `fittrack plan create` to start one.");
    } else {
        print_plan_table(&list.plans);
    }
    Ok(())
}

pub(crate) async fn cmd_plan_show<R: MealPlanRemote, S: KeyValueStore>(
    svc: &Service<R, S>,
    id: &str,
    week: bool,
    json: bool,
) -> Result<()> {
    let plan = match svc.get_by_id(&EntityId::parse(id)).await {
        Ok(plan) => plan,
        Err(e) if json => {
            println!("{}", json_error(&format!("{e:#}")));
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if json {
        if week {
            let totals = plan.week_totals();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "plan": plan,
                    "week_totals": DayOfWeek::ALL
                        .iter()
                        .zip(totals.iter())
                        .map(|(d, t)| serde_json::json!({ "day": d, "totals": t }))
                        .collect::<Vec<_>>(),
                }))?
            );
        } else {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    } else {
        print_plan_detail(&plan);
        if week {
            println!();
            print_week_table(&plan);
        }
    }
    Ok(())
}

pub(crate) struct PlanFields {
    pub name: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
    pub calories: Option<f64>,
    pub protein: Option<f64>,
    pub carbs: Option<f64>,
    pub fat: Option<f64>,
}

pub(crate) async fn cmd_plan_create<R: MealPlanRemote, S: KeyValueStore>(
    svc: &Service<R, S>,
    fields: PlanFields,
    json: bool,
) -> Result<()> {
    let data = NewMealPlan {
        name: fields.name.unwrap_or_default(),
        description: fields.description,
        is_active: fields.active.unwrap_or(false),
        items: Vec::new(),
        target_calories: fields.calories,
        target_protein_g: fields.protein,
        target_carbs_g: fields.carbs,
        target_fat_g: fields.fat,
    };
    let plan = svc.create(&data).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else if plan.id.is_local() {
        println!("Saved '{}' on this device as {} (server unreachable)", plan.name, plan.id);
    } else {
        println!("Created '{}' ({})", plan.name, plan.id);
    }
    Ok(())
}

pub(crate) async fn cmd_plan_update<R: MealPlanRemote, S: KeyValueStore>(
    svc: &Service<R, S>,
    id: &str,
    fields: PlanFields,
    clear_description: bool,
    json: bool,
) -> Result<()> {
    let description = if clear_description {
        Some(None)
    } else {
        fields.description.map(Some)
    };
    let update = UpdateMealPlan {
        name: fields.name,
        description,
        is_active: fields.active,
        items: None,
        target_calories: fields.calories.map(Some),
        target_protein_g: fields.protein.map(Some),
        target_carbs_g: fields.carbs.map(Some),
        target_fat_g: fields.fat.map(Some),
    };
    if update.is_empty() {
        bail!("Nothing to update. Pass at least one field to change.");
    }

    let plan = svc.update(&EntityId::parse(id), &update).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("Updated '{}' ({})", plan.name, plan.id);
    }
    Ok(())
}

pub(crate) async fn cmd_plan_delete<R: MealPlanRemote, S: KeyValueStore>(
    svc: &Service<R, S>,
    id: &str,
    json: bool,
) -> Result<()> {
    svc.delete(&EntityId::parse(id)).await?;

    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted meal plan {id}");
    }
    Ok(())
}

pub(crate) struct ItemArgs {
    pub day: String,
    pub meal: String,
    pub meal_id: String,
    pub meal_name: Option<String>,
    pub quantity: f64,
    pub unit: Option<String>,
    pub per_100: Option<MacroSnapshot>,
}

pub(crate) async fn cmd_plan_add_item<R: MealPlanRemote, S: KeyValueStore>(
    svc: &Service<R, S>,
    id: &str,
    args: ItemArgs,
    json: bool,
) -> Result<()> {
    let mut item = MealPlanItem::new(
        DayOfWeek::parse(&args.day)?,
        MealType::parse(&args.meal)?,
        &args.meal_id,
        args.quantity,
        args.unit.as_deref(),
        args.per_100.as_ref(),
    )?;
    item.meal_name = args.meal_name.filter(|n| !n.trim().is_empty());

    let id = EntityId::parse(id);
    let plan = svc.get_by_id(&id).await?;
    let mut items = plan.items;
    items.push(item);

    let update = UpdateMealPlan {
        items: Some(items),
        ..UpdateMealPlan::default()
    };
    let plan = svc.update(&id, &update).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!(
            "Added {} {} to '{}' ({} items)",
            args.day.to_lowercase(),
            args.meal.to_lowercase(),
            plan.name,
            plan.items.len()
        );
    }
    Ok(())
}

pub(crate) async fn cmd_plan_sync<R: MealPlanRemote, S: KeyValueStore>(
    svc: &Service<R, S>,
    json: bool,
) -> Result<()> {
    let report = svc.sync_local_only().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.pushed.is_empty() && report.failed.is_empty() {
        println!("Nothing to sync.");
    }
    for (local, remote) in &report.pushed {
        println!("Uploaded {local} as {remote}");
    }
    for (local, reason) in &report.failed {
        eprintln!("Could not upload {local}: {reason}");
    }
    Ok(())
}
