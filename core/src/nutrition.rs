use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::meal_plans::DataSource;
use crate::models::backend_failure;
use crate::storage::{KeyValueStore, NUTRITION_PROFILE_KEY, get_json, set_json};

/// Daily intake never drops below this, whatever the goal.
pub const MIN_TARGET_CALORIES: f64 = 1200.0;

const KCAL_PER_G_PROTEIN: f64 = 4.0;
const KCAL_PER_G_CARBS: f64 = 4.0;
const KCAL_PER_G_FAT: f64 = 9.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    #[serde(alias = "m")]
    Male,
    #[serde(alias = "f")]
    Female,
}

impl Sex {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" => Ok(Sex::Male),
            "female" | "f" => Ok(Sex::Female),
            other => bail!("Invalid sex '{other}'. Must be one of: male, female"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Sedentary,
    #[serde(alias = "lightly_active")]
    Light,
    #[serde(alias = "moderately_active")]
    Moderate,
    Active,
    #[serde(alias = "extra_active")]
    VeryActive,
}

impl ActivityLevel {
    #[must_use]
    pub fn multiplier(self) -> f64 {
        match self {
            ActivityLevel::Sedentary => 1.2,
            ActivityLevel::Light => 1.375,
            ActivityLevel::Moderate => 1.55,
            ActivityLevel::Active => 1.725,
            ActivityLevel::VeryActive => 1.9,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "sedentary" => Ok(ActivityLevel::Sedentary),
            "light" | "lightly_active" => Ok(ActivityLevel::Light),
            "moderate" | "moderately_active" => Ok(ActivityLevel::Moderate),
            "active" => Ok(ActivityLevel::Active),
            "very_active" | "extra_active" => Ok(ActivityLevel::VeryActive),
            other => bail!(
                "Invalid activity level '{other}'. Must be one of: sedentary, light, moderate, active, very_active"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    #[serde(alias = "lose_weight", alias = "weight_loss")]
    Lose,
    Maintain,
    #[serde(alias = "gain_weight", alias = "muscle_gain")]
    Gain,
}

impl Goal {
    /// Calories added to maintenance for this goal.
    #[must_use]
    pub fn calorie_adjustment(self) -> f64 {
        match self {
            Goal::Lose => -500.0,
            Goal::Maintain => 0.0,
            Goal::Gain => 300.0,
        }
    }

    #[must_use]
    pub fn default_split(self) -> MacroSplit {
        match self {
            Goal::Lose => MacroSplit::new(40, 30, 30),
            Goal::Maintain => MacroSplit::new(30, 40, 30),
            Goal::Gain => MacroSplit::new(30, 45, 25),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "lose" | "lose_weight" | "weight_loss" | "cut" => Ok(Goal::Lose),
            "maintain" => Ok(Goal::Maintain),
            "gain" | "gain_weight" | "muscle_gain" | "bulk" => Ok(Goal::Gain),
            other => bail!("Invalid goal '{other}'. Must be one of: lose, maintain, gain"),
        }
    }
}

/// Percent of calories from each macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroSplit {
    pub protein_pct: i32,
    pub carbs_pct: i32,
    pub fat_pct: i32,
}

impl MacroSplit {
    #[must_use]
    pub fn new(protein_pct: i32, carbs_pct: i32, fat_pct: i32) -> Self {
        Self {
            protein_pct,
            carbs_pct,
            fat_pct,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_macro_split(
            i64::from(self.protein_pct),
            i64::from(self.carbs_pct),
            i64::from(self.fat_pct),
        )
    }
}

pub fn validate_macro_split(protein: i64, carbs: i64, fat: i64) -> Result<()> {
    if protein < 0 || carbs < 0 || fat < 0 {
        bail!("Macro percentages must be non-negative");
    }
    if protein > 100 || carbs > 100 || fat > 100 {
        bail!("Each macro percentage must be between 0 and 100");
    }
    let sum = protein + carbs + fat;
    if sum != 100 {
        bail!("Macro percentages must sum to 100 (got {sum})");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionProfile {
    pub age: u32,
    pub sex: Sex,
    pub height_cm: f64,
    pub weight_kg: f64,
    pub activity_level: ActivityLevel,
    pub goal: Goal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macro_split: Option<MacroSplit>,
}

pub fn validate_profile(profile: &NutritionProfile) -> Result<()> {
    if !(1..=120).contains(&profile.age) {
        bail!("Age must be between 1 and 120");
    }
    if !(profile.height_cm > 0.0 && profile.height_cm.is_finite()) {
        bail!("Height must be greater than 0");
    }
    if !(profile.weight_kg > 0.0 && profile.weight_kg.is_finite()) {
        bail!("Weight must be greater than 0");
    }
    if let Some(split) = &profile.macro_split {
        split.validate()?;
    }
    Ok(())
}

/// Daily calorie and macro targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroPlan {
    #[serde(default)]
    pub bmr: f64,
    #[serde(default)]
    pub tdee: f64,
    #[serde(alias = "calories", alias = "daily_calories")]
    pub target_calories: f64,
    pub protein_g: f64,
    #[serde(alias = "carbohydrates_g")]
    pub carbs_g: f64,
    pub fat_g: f64,
    #[serde(default)]
    pub protein_pct: i32,
    #[serde(default)]
    pub carbs_pct: i32,
    #[serde(default)]
    pub fat_pct: i32,
}

/// Mifflin-St Jeor resting energy expenditure, kcal/day.
#[must_use]
pub fn bmr(profile: &NutritionProfile) -> f64 {
    let base = 10.0 * profile.weight_kg + 6.25 * profile.height_cm - 5.0 * f64::from(profile.age);
    match profile.sex {
        Sex::Male => base + 5.0,
        Sex::Female => base - 161.0,
    }
}

/// Targets from the profile alone, without asking the server.
pub fn calculate_macros(profile: &NutritionProfile) -> Result<MacroPlan> {
    validate_profile(profile)?;

    let bmr = bmr(profile);
    let tdee = bmr * profile.activity_level.multiplier();
    let target = (tdee + profile.goal.calorie_adjustment()).max(MIN_TARGET_CALORIES);
    let split = profile
        .macro_split
        .unwrap_or_else(|| profile.goal.default_split());

    let grams = |pct: i32, kcal_per_g: f64| round1(target * f64::from(pct) / 100.0 / kcal_per_g);

    Ok(MacroPlan {
        bmr: round1(bmr),
        tdee: round1(tdee),
        target_calories: target.round(),
        protein_g: grams(split.protein_pct, KCAL_PER_G_PROTEIN),
        carbs_g: grams(split.carbs_pct, KCAL_PER_G_CARBS),
        fat_g: grams(split.fat_pct, KCAL_PER_G_FAT),
        protein_pct: split.protein_pct,
        carbs_pct: split.carbs_pct,
        fat_pct: split.fat_pct,
    })
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Bodies the nutrition endpoints answer with: `{success, data}` or the bare value.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Data {
        success: bool,
        data: Option<T>,
        message: Option<String>,
    },
    Bare(T),
}

impl<T> Envelope<T> {
    pub fn into_inner(self) -> Result<T> {
        match self {
            Envelope::Bare(value)
            | Envelope::Data {
                success: true,
                data: Some(value),
                ..
            } => Ok(value),
            Envelope::Data {
                success: true,
                data: None,
                ..
            } => Err(ApiError::UnexpectedShape("empty data".to_string()).into()),
            Envelope::Data {
                success: false,
                message,
                ..
            } => Err(backend_failure(message)),
        }
    }
}

#[async_trait]
pub trait NutritionRemote: Send + Sync {
    async fn profile(&self) -> Result<Envelope<NutritionProfile>>;
    async fn calculate(&self, profile: &NutritionProfile) -> Result<Envelope<MacroPlan>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Calculation {
    pub plan: MacroPlan,
    pub source: DataSource,
}

pub struct NutritionService<R, S> {
    remote: R,
    store: Mutex<S>,
    remote_timeout: Duration,
}

impl<R: NutritionRemote, S: KeyValueStore> NutritionService<R, S> {
    pub fn new(remote: R, store: S, remote_timeout: Duration) -> Self {
        Self {
            remote,
            store: Mutex::new(store),
            remote_timeout,
        }
    }

    /// The server's profile, falling back to the last one seen locally.
    pub async fn profile(&self) -> Result<(NutritionProfile, DataSource)> {
        let fetched = match tokio::time::timeout(self.remote_timeout, self.remote.profile()).await
        {
            Ok(result) => result.and_then(Envelope::into_inner),
            Err(_) => Err(ApiError::Timeout(self.remote_timeout).into()),
        };

        match fetched {
            Ok(profile) => {
                if let Err(e) = self.save_profile(&profile) {
                    warn!(error = %e, "could not cache nutrition profile");
                }
                Ok((profile, DataSource::Remote))
            }
            Err(e) => {
                debug!(error = %e, "profile unavailable remotely, using cached copy");
                match self.cached_profile()? {
                    Some(profile) => Ok((profile, DataSource::Local)),
                    None => Err(e),
                }
            }
        }
    }

    pub fn cached_profile(&self) -> Result<Option<NutritionProfile>> {
        let store = self.lock_store()?;
        get_json(&*store, NUTRITION_PROFILE_KEY)
    }

    pub fn save_profile(&self, profile: &NutritionProfile) -> Result<()> {
        validate_profile(profile)?;
        let store = self.lock_store()?;
        set_json(&*store, NUTRITION_PROFILE_KEY, profile)
    }

    /// Server-computed targets, or the local formulas when it is unreachable.
    pub async fn calculate(&self, profile: &NutritionProfile) -> Result<Calculation> {
        validate_profile(profile)?;

        let fetched =
            match tokio::time::timeout(self.remote_timeout, self.remote.calculate(profile)).await {
                Ok(result) => result.and_then(Envelope::into_inner),
                Err(_) => Err(ApiError::Timeout(self.remote_timeout).into()),
            };

        match fetched {
            Ok(plan) => Ok(Calculation {
                plan,
                source: DataSource::Remote,
            }),
            Err(e) => {
                debug!(error = %e, "macro calculation unavailable remotely, computing locally");
                Ok(Calculation {
                    plan: calculate_macros(profile)?,
                    source: DataSource::Local,
                })
            }
        }
    }

    fn lock_store(&self) -> Result<std::sync::MutexGuard<'_, S>> {
        self.store
            .lock()
            .map_err(|_| anyhow!("local store lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn profile() -> NutritionProfile {
        NutritionProfile {
            age: 30,
            sex: Sex::Male,
            height_cm: 180.0,
            weight_kg: 80.0,
            activity_level: ActivityLevel::Moderate,
            goal: Goal::Maintain,
            macro_split: None,
        }
    }

    #[test]
    fn test_bmr_mifflin_st_jeor() {
        assert!((bmr(&profile()) - 1780.0).abs() < 0.01);

        let female = NutritionProfile {
            sex: Sex::Female,
            ..profile()
        };
        assert!((bmr(&female) - 1614.0).abs() < 0.01);
    }

    #[test]
    fn test_calculate_maintain() {
        let plan = calculate_macros(&profile()).unwrap();
        assert!((plan.tdee - 2759.0).abs() < 0.01);
        assert!((plan.target_calories - 2759.0).abs() < 0.01);
        assert_eq!(
            (plan.protein_pct, plan.carbs_pct, plan.fat_pct),
            (30, 40, 30)
        );
        assert!((plan.protein_g - 206.9).abs() < 0.01);
        assert!((plan.carbs_g - 275.9).abs() < 0.01);
        assert!((plan.fat_g - 92.0).abs() < 0.01);
    }

    #[test]
    fn test_calculate_respects_calorie_floor() {
        let small = NutritionProfile {
            age: 25,
            sex: Sex::Female,
            height_cm: 165.0,
            weight_kg: 60.0,
            activity_level: ActivityLevel::Sedentary,
            goal: Goal::Lose,
            macro_split: None,
        };
        let plan = calculate_macros(&small).unwrap();
        assert!((plan.target_calories - MIN_TARGET_CALORIES).abs() < 0.01);
        assert_eq!(plan.protein_pct, 40);
        assert!((plan.protein_g - 120.0).abs() < 0.01);
    }

    #[test]
    fn test_calculate_gain_adds_surplus() {
        let gain = NutritionProfile {
            goal: Goal::Gain,
            ..profile()
        };
        let plan = calculate_macros(&gain).unwrap();
        assert!((plan.target_calories - 3059.0).abs() < 0.01);
        assert_eq!(plan.fat_pct, 25);
    }

    #[test]
    fn test_custom_split() {
        let custom = NutritionProfile {
            macro_split: Some(MacroSplit::new(50, 25, 25)),
            ..profile()
        };
        let plan = calculate_macros(&custom).unwrap();
        assert_eq!(plan.protein_pct, 50);

        let bad = NutritionProfile {
            macro_split: Some(MacroSplit::new(50, 50, 50)),
            ..profile()
        };
        assert!(calculate_macros(&bad).is_err());
    }

    #[test]
    fn test_validate_macro_split() {
        assert!(validate_macro_split(40, 30, 30).is_ok());
        assert!(validate_macro_split(100, 0, 0).is_ok());
        assert!(validate_macro_split(40, 30, 20).is_err());
        assert!(validate_macro_split(-10, 60, 50).is_err());
        assert!(validate_macro_split(110, -5, -5).is_err());
    }

    #[test]
    fn test_validate_profile() {
        assert!(validate_profile(&profile()).is_ok());
        assert!(
            validate_profile(&NutritionProfile {
                age: 0,
                ..profile()
            })
            .is_err()
        );
        assert!(
            validate_profile(&NutritionProfile {
                weight_kg: -1.0,
                ..profile()
            })
            .is_err()
        );
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!(Sex::parse("F").unwrap(), Sex::Female);
        assert_eq!(
            ActivityLevel::parse("very-active").unwrap(),
            ActivityLevel::VeryActive
        );
        assert_eq!(Goal::parse("cut").unwrap(), Goal::Lose);
        assert!(Goal::parse("shred").is_err());
    }

    #[test]
    fn test_profile_serde_aliases() {
        let p: NutritionProfile = serde_json::from_value(json!({
            "age": 40, "sex": "female", "height_cm": 170, "weight_kg": 70,
            "activity_level": "lightly_active", "goal": "lose_weight"
        }))
        .unwrap();
        assert_eq!(p.activity_level, ActivityLevel::Light);
        assert_eq!(p.goal, Goal::Lose);
        assert!(p.macro_split.is_none());
    }

    #[test]
    fn test_envelope_shapes() {
        let bare: Envelope<MacroPlan> = serde_json::from_value(json!({
            "calories": 2000, "protein_g": 150, "carbs_g": 200, "fat_g": 67
        }))
        .unwrap();
        assert!((bare.into_inner().unwrap().target_calories - 2000.0).abs() < 0.01);

        let wrapped: Envelope<NutritionProfile> = serde_json::from_value(json!({
            "success": true,
            "data": {
                "age": 41, "sex": "female", "height_cm": 165, "weight_kg": 62,
                "activity_level": "light", "goal": "lose"
            }
        }))
        .unwrap();
        let profile = wrapped.into_inner().unwrap();
        assert_eq!(profile.age, 41);
        assert_eq!(profile.goal, Goal::Lose);

        let empty: Envelope<NutritionProfile> =
            serde_json::from_value(json!({ "success": true })).unwrap();
        assert!(empty.into_inner().is_err());

        let failed: Envelope<MacroPlan> =
            serde_json::from_value(json!({ "success": false, "message": "no profile" })).unwrap();
        let err = failed.into_inner().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::Backend(m)) if m == "no profile"
        ));
    }

    #[derive(Default)]
    struct MockRemote {
        offline: AtomicBool,
        calls: AtomicUsize,
        profile: Option<NutritionProfile>,
    }

    #[async_trait]
    impl NutritionRemote for MockRemote {
        async fn profile(&self) -> Result<Envelope<NutritionProfile>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(ApiError::Transport("connection refused".into()).into());
            }
            match &self.profile {
                Some(p) => Ok(Envelope::Data {
                    success: true,
                    data: Some(p.clone()),
                    message: None,
                }),
                None => Err(ApiError::not_found("nutrition profile").into()),
            }
        }

        async fn calculate(&self, _profile: &NutritionProfile) -> Result<Envelope<MacroPlan>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(ApiError::Transport("connection refused".into()).into());
            }
            Ok(Envelope::Bare(MacroPlan {
                bmr: 0.0,
                tdee: 0.0,
                target_calories: 2100.0,
                protein_g: 160.0,
                carbs_g: 210.0,
                fat_g: 70.0,
                protein_pct: 30,
                carbs_pct: 40,
                fat_pct: 30,
            }))
        }
    }

    fn service(remote: MockRemote) -> NutritionService<MockRemote, Database> {
        NutritionService::new(
            remote,
            Database::open_in_memory().unwrap(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_profile_cached_then_served_offline() {
        let svc = service(MockRemote {
            profile: Some(profile()),
            ..MockRemote::default()
        });

        let (p, source) = svc.profile().await.unwrap();
        assert_eq!(source, DataSource::Remote);
        assert_eq!(p, profile());

        svc.remote.offline.store(true, Ordering::SeqCst);
        let (p, source) = svc.profile().await.unwrap();
        assert_eq!(source, DataSource::Local);
        assert_eq!(p.age, 30);
    }

    #[tokio::test]
    async fn test_profile_offline_without_cache_fails() {
        let svc = service(MockRemote::default());
        svc.remote.offline.store(true, Ordering::SeqCst);
        assert!(svc.profile().await.is_err());
    }

    #[tokio::test]
    async fn test_calculate_prefers_remote() {
        let svc = service(MockRemote::default());
        let calc = svc.calculate(&profile()).await.unwrap();
        assert_eq!(calc.source, DataSource::Remote);
        assert!((calc.plan.target_calories - 2100.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_calculate_falls_back_to_local_formula() {
        let svc = service(MockRemote::default());
        svc.remote.offline.store(true, Ordering::SeqCst);
        let calc = svc.calculate(&profile()).await.unwrap();
        assert_eq!(calc.source, DataSource::Local);
        assert!((calc.plan.target_calories - 2759.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_calculate_validates_before_request() {
        let svc = service(MockRemote::default());
        let bad = NutritionProfile {
            height_cm: 0.0,
            ..profile()
        };
        assert!(svc.calculate(&bad).await.is_err());
        assert_eq!(svc.remote.calls.load(Ordering::SeqCst), 0);
    }
}
