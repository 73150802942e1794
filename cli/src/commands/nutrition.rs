use anyhow::Result;

use fittrack_core::meal_plans::DataSource;
use fittrack_core::nutrition::{
    ActivityLevel, Goal, MacroPlan, MacroSplit, NutritionProfile, NutritionRemote,
    NutritionService, Sex, calculate_macros,
};
use fittrack_core::storage::KeyValueStore;

use super::helpers::{json_error, source_note};

pub(crate) struct ProfileArgs {
    pub age: u32,
    pub sex: String,
    pub height: f64,
    pub weight: f64,
    pub activity: String,
    pub goal: String,
    pub protein: Option<i32>,
    pub carbs: Option<i32>,
    pub fat: Option<i32>,
}

impl ProfileArgs {
    fn into_profile(self) -> Result<NutritionProfile> {
        let macro_split = match (self.protein, self.carbs, self.fat) {
            (Some(p), Some(c), Some(f)) => Some(MacroSplit::new(p, c, f)),
            (None, None, None) => None,
            _ => anyhow::bail!(
                "If setting macro percentages, all three (--protein, --carbs, --fat) must be provided"
            ),
        };
        Ok(NutritionProfile {
            age: self.age,
            sex: Sex::parse(&self.sex)?,
            height_cm: self.height,
            weight_kg: self.weight,
            activity_level: ActivityLevel::parse(&self.activity)?,
            goal: Goal::parse(&self.goal)?,
            macro_split,
        })
    }
}

fn print_macro_plan(plan: &MacroPlan, source: DataSource) {
    if plan.bmr > 0.0 {
        println!("BMR:  {:.0} kcal", plan.bmr);
    }
    if plan.tdee > 0.0 {
        println!("TDEE: {:.0} kcal", plan.tdee);
    }
    println!("Target: {:.0} kcal/day", plan.target_calories);
    println!(
        "  Protein: {:.0}g ({}%) | Carbs: {:.0}g ({}%) | Fat: {:.0}g ({}%)",
        plan.protein_g, plan.protein_pct, plan.carbs_g, plan.carbs_pct, plan.fat_g, plan.fat_pct
    );
    if source == DataSource::Local {
        println!("  (calculated on this device)");
    }
}

pub(crate) async fn cmd_macros<R: NutritionRemote, S: KeyValueStore>(
    svc: &NutritionService<R, S>,
    args: ProfileArgs,
    local_only: bool,
    save: bool,
    json: bool,
) -> Result<()> {
    let profile = args.into_profile()?;
    if save {
        svc.save_profile(&profile)?;
    }

    let (plan, source) = if local_only {
        (calculate_macros(&profile)?, DataSource::Local)
    } else {
        let calc = svc.calculate(&profile).await?;
        (calc.plan, calc.source)
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "profile": profile,
                "plan": plan,
                "source": source,
            }))?
        );
    } else {
        print_macro_plan(&plan, source);
    }
    Ok(())
}

pub(crate) async fn cmd_profile<R: NutritionRemote, S: KeyValueStore>(
    svc: &NutritionService<R, S>,
    json: bool,
) -> Result<()> {
    let (profile, source) = match svc.profile().await {
        Ok(found) => found,
        Err(e) if json => {
            println!("{}", json_error(&format!("{e:#}")));
            return Ok(());
        }
        Err(e) => return Err(e.context("No nutrition profile available")),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "profile": profile,
                "source": source,
            }))?
        );
        return Ok(());
    }

    source_note(source);
    println!(
        "{} y, {:?}, {:.0} cm, {:.1} kg",
        profile.age, profile.sex, profile.height_cm, profile.weight_kg
    );
    println!(
        "Activity: {:?} | Goal: {:?}",
        profile.activity_level, profile.goal
    );
    if let Some(split) = profile.macro_split {
        println!(
            "Macro split: P {}% / C {}% / F {}%",
            split.protein_pct, split.carbs_pct, split.fat_pct
        );
    }
    let plan = calculate_macros(&profile)?;
    println!();
    print_macro_plan(&plan, DataSource::Local);
    Ok(())
}
