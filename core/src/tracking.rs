use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{DayOfWeek, EntityId, MacroSnapshot, MealPlan, MealType};
use crate::storage::{
    CALORIE_NOTE_PREFIX, KeyValueStore, calorie_note_key, completed_meals_key, get_json, set_json,
};

/// A plan item the user ticked off on a given date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedMeal {
    pub meal_type: MealType,
    pub meal_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayProgress {
    pub date: NaiveDate,
    pub day: DayOfWeek,
    pub plan_id: EntityId,
    pub planned: MacroSnapshot,
    pub eaten: MacroSnapshot,
    pub target_calories: Option<f64>,
    pub target_protein_g: Option<f64>,
    pub target_carbs_g: Option<f64>,
    pub target_fat_g: Option<f64>,
    /// Target minus eaten; negative once over target.
    pub remaining_calories: Option<f64>,
    pub completed: Vec<CompletedMeal>,
    pub note: Option<String>,
}

/// Per-date completion marks and calorie notes, kept on this device only.
pub struct DailyTracker<S> {
    store: S,
}

impl<S: KeyValueStore> DailyTracker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn completed(&self, date: NaiveDate) -> Result<Vec<CompletedMeal>> {
        Ok(get_json(&self.store, &completed_meals_key(date))?.unwrap_or_default())
    }

    /// Returns `false` if the meal was already marked.
    pub fn mark_done(&self, date: NaiveDate, meal: CompletedMeal) -> Result<bool> {
        let mut done = self.completed(date)?;
        if done.contains(&meal) {
            return Ok(false);
        }
        done.push(meal);
        set_json(&self.store, &completed_meals_key(date), &done)?;
        Ok(true)
    }

    /// Returns `false` if the meal was not marked.
    pub fn undo(&self, date: NaiveDate, meal: &CompletedMeal) -> Result<bool> {
        let mut done = self.completed(date)?;
        let before = done.len();
        done.retain(|m| m != meal);
        if done.len() == before {
            return Ok(false);
        }
        let key = completed_meals_key(date);
        if done.is_empty() {
            self.store.remove(&key)?;
        } else {
            set_json(&self.store, &key, &done)?;
        }
        Ok(true)
    }

    pub fn note(&self, date: NaiveDate) -> Result<Option<String>> {
        self.store.get(&calorie_note_key(date))
    }

    /// Store a free-text note for `date`. A blank note clears it.
    pub fn set_note(&self, date: NaiveDate, note: &str) -> Result<()> {
        let key = calorie_note_key(date);
        let note = note.trim();
        if note.is_empty() {
            self.store.remove(&key)?;
        } else {
            self.store.set(&key, note)?;
        }
        Ok(())
    }

    /// Every date that has a note, oldest first.
    pub fn noted_dates(&self) -> Result<Vec<NaiveDate>> {
        let dates = self
            .store
            .keys_with_prefix(CALORIE_NOTE_PREFIX)?
            .iter()
            .filter_map(|k| k.strip_prefix(CALORIE_NOTE_PREFIX))
            .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .collect();
        Ok(dates)
    }

    /// Planned vs. eaten for the plan's items scheduled on `date`'s weekday.
    pub fn progress(&self, plan: &MealPlan, date: NaiveDate) -> Result<DayProgress> {
        let day = DayOfWeek::of_date(date);
        let completed = self.completed(date)?;

        let mut eaten = MacroSnapshot::default();
        for item in plan.items.iter().filter(|i| i.day_of_week == day) {
            let is_done = completed
                .iter()
                .any(|c| c.meal_type == item.meal_type && c.meal_id == item.meal_id);
            if is_done && let Some(m) = &item.macros {
                eaten.add(m);
            }
        }

        Ok(DayProgress {
            date,
            day,
            plan_id: plan.id.clone(),
            planned: plan.day_totals(day),
            eaten,
            target_calories: plan.target_calories,
            target_protein_g: plan.target_protein_g,
            target_carbs_g: plan.target_carbs_g,
            target_fat_g: plan.target_fat_g,
            remaining_calories: plan.target_calories.map(|t| t - eaten.calories),
            completed,
            note: self.note(date)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{MealPlanItem, NewMealPlan};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn meal(meal_type: MealType, id: &str) -> CompletedMeal {
        CompletedMeal {
            meal_type,
            meal_id: id.to_string(),
        }
    }

    fn per_100(calories: f64) -> MacroSnapshot {
        MacroSnapshot {
            calories,
            protein_g: 10.0,
            carbohydrates_g: 20.0,
            fat_g: 5.0,
        }
    }

    fn plan() -> MealPlan {
        // 2024-06-03 is a Monday
        let items = vec![
            MealPlanItem::new(
                DayOfWeek::Monday,
                MealType::Breakfast,
                "oats",
                50.0,
                None,
                Some(&per_100(380.0)),
            )
            .unwrap(),
            MealPlanItem::new(
                DayOfWeek::Monday,
                MealType::Lunch,
                "7",
                200.0,
                None,
                Some(&per_100(150.0)),
            )
            .unwrap(),
            MealPlanItem::new(
                DayOfWeek::Tuesday,
                MealType::Dinner,
                "8",
                100.0,
                None,
                Some(&per_100(500.0)),
            )
            .unwrap(),
        ];
        MealPlan::new_local(&NewMealPlan {
            name: "Week".to_string(),
            is_active: true,
            items,
            target_calories: Some(2000.0),
            ..NewMealPlan::default()
        })
    }

    #[test]
    fn test_mark_and_undo() {
        let tracker = DailyTracker::new(Database::open_in_memory().unwrap());
        let d = date("2024-06-03");

        assert!(tracker.mark_done(d, meal(MealType::Breakfast, "oats")).unwrap());
        assert!(!tracker.mark_done(d, meal(MealType::Breakfast, "oats")).unwrap());
        assert!(tracker.mark_done(d, meal(MealType::Lunch, "7")).unwrap());
        assert_eq!(tracker.completed(d).unwrap().len(), 2);
        assert!(tracker.completed(date("2024-06-04")).unwrap().is_empty());

        assert!(tracker.undo(d, &meal(MealType::Lunch, "7")).unwrap());
        assert!(!tracker.undo(d, &meal(MealType::Lunch, "7")).unwrap());
        assert!(tracker.undo(d, &meal(MealType::Breakfast, "oats")).unwrap());
        assert!(tracker.store.get(&completed_meals_key(d)).unwrap().is_none());
    }

    #[test]
    fn test_notes() {
        let tracker = DailyTracker::new(Database::open_in_memory().unwrap());
        tracker
            .set_note(date("2024-06-04"), "  birthday cake  ")
            .unwrap();
        tracker.set_note(date("2024-06-01"), "cheat day").unwrap();

        assert_eq!(
            tracker.note(date("2024-06-04")).unwrap().as_deref(),
            Some("birthday cake")
        );
        assert_eq!(
            tracker.noted_dates().unwrap(),
            vec![date("2024-06-01"), date("2024-06-04")]
        );

        tracker.set_note(date("2024-06-04"), "   ").unwrap();
        assert!(tracker.note(date("2024-06-04")).unwrap().is_none());
        assert_eq!(tracker.noted_dates().unwrap(), vec![date("2024-06-01")]);
    }

    #[test]
    fn test_progress() {
        let tracker = DailyTracker::new(Database::open_in_memory().unwrap());
        let monday = date("2024-06-03");
        let plan = plan();
        tracker
            .mark_done(monday, meal(MealType::Breakfast, "oats"))
            .unwrap();
        // Completed but not in the plan for Monday: ignored in totals
        tracker.mark_done(monday, meal(MealType::Dinner, "8")).unwrap();
        tracker.set_note(monday, "skipped snack").unwrap();

        let progress = tracker.progress(&plan, monday).unwrap();
        assert_eq!(progress.day, DayOfWeek::Monday);
        assert!((progress.planned.calories - 490.0).abs() < 0.01);
        assert!((progress.eaten.calories - 190.0).abs() < 0.01);
        assert!((progress.remaining_calories.unwrap() - 1810.0).abs() < 0.01);
        assert_eq!(progress.completed.len(), 2);
        assert_eq!(progress.note.as_deref(), Some("skipped snack"));
    }

    #[test]
    fn test_week_totals() {
        let totals = plan().week_totals();
        assert!((totals[DayOfWeek::Monday.index()].calories - 490.0).abs() < 0.01);
        assert!((totals[DayOfWeek::Tuesday.index()].calories - 500.0).abs() < 0.01);
        assert!(totals[DayOfWeek::Sunday.index()].calories.abs() < 0.01);
    }
}
