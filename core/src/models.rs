use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Result, bail};
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ApiError;

/// Reserved prefix for identifiers minted on this device.
pub const LOCAL_ID_PREFIX: &str = "local-";

static LAST_LOCAL_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Identifier of a cached entity, tagged with the backend that owns it.
///
/// Local ids are `local-<unix millis>`; the server never issues ids with that
/// prefix, so parsing is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityId {
    Local(String),
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Local,
    Remote,
}

impl EntityId {
    /// Mint a fresh local id. Strictly increasing within the process, even
    /// when called twice in the same millisecond.
    #[must_use]
    pub fn new_local() -> Self {
        let now = Utc::now().timestamp_millis();
        let mut prev = LAST_LOCAL_MILLIS.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match LAST_LOCAL_MILLIS.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return EntityId::Local(format!("{LOCAL_ID_PREFIX}{next}")),
                Err(actual) => prev = actual,
            }
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with(LOCAL_ID_PREFIX) {
            EntityId::Local(raw.to_string())
        } else {
            EntityId::Remote(raw.to_string())
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EntityId::Local(s) | EntityId::Remote(s) => s,
        }
    }

    #[must_use]
    pub fn provenance(&self) -> Provenance {
        match self {
            EntityId::Local(_) => Provenance::Local,
            EntityId::Remote(_) => Provenance::Remote,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, EntityId::Local(_))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = string_or_number(deserializer)?;
        Ok(EntityId::parse(&raw))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Int(i64),
    Float(f64),
    Str(String),
}

/// Servers send ids as numbers or strings; keep them as strings.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match RawScalar::deserialize(deserializer)? {
        RawScalar::Int(i) => i.to_string(),
        RawScalar::Float(f) => f.to_string(),
        RawScalar::Str(s) => s,
    })
}

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

// --- Day / meal enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
        DayOfWeek::Saturday,
        DayOfWeek::Sunday,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DayOfWeek::Monday => "monday",
            DayOfWeek::Tuesday => "tuesday",
            DayOfWeek::Wednesday => "wednesday",
            DayOfWeek::Thursday => "thursday",
            DayOfWeek::Friday => "friday",
            DayOfWeek::Saturday => "saturday",
            DayOfWeek::Sunday => "sunday",
        }
    }

    /// 0 = Monday .. 6 = Sunday.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(i: i64) -> Option<Self> {
        usize::try_from(i).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    #[must_use]
    pub fn of_date(date: NaiveDate) -> Self {
        Self::ALL[date.weekday().num_days_from_monday() as usize]
    }

    pub fn parse(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let day = match lower.as_str() {
            "monday" | "mon" => DayOfWeek::Monday,
            "tuesday" | "tue" => DayOfWeek::Tuesday,
            "wednesday" | "wed" => DayOfWeek::Wednesday,
            "thursday" | "thu" => DayOfWeek::Thursday,
            "friday" | "fri" => DayOfWeek::Friday,
            "saturday" | "sat" => DayOfWeek::Saturday,
            "sunday" | "sun" => DayOfWeek::Sunday,
            _ => bail!("Invalid day '{s}'. Must be one of: monday-sunday or mon-sun"),
        };
        Ok(day)
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DayOfWeek {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DayOfWeek {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawScalar::deserialize(deserializer)? {
            RawScalar::Int(i) => DayOfWeek::from_index(i)
                .ok_or_else(|| serde::de::Error::custom(format!("day_of_week out of range: {i}"))),
            RawScalar::Str(s) => DayOfWeek::parse(&s).map_err(serde::de::Error::custom),
            RawScalar::Float(f) => Err(serde::de::Error::custom(format!(
                "day_of_week must be a name or 0-6, got {f}"
            ))),
        }
    }
}

pub const MEAL_TYPES: &[&str] = &["breakfast", "brunch", "lunch", "snack", "dinner", "other"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Breakfast,
    Brunch,
    Lunch,
    Snack,
    Dinner,
    Other,
}

impl MealType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        MEAL_TYPES[self as usize]
    }

    pub fn parse(meal: &str) -> Result<Self> {
        let lower = meal.trim().to_lowercase();
        let meal_type = match lower.as_str() {
            "breakfast" => MealType::Breakfast,
            "brunch" => MealType::Brunch,
            "lunch" => MealType::Lunch,
            "snack" => MealType::Snack,
            "dinner" => MealType::Dinner,
            "other" => MealType::Other,
            _ => bail!(
                "Invalid meal type '{meal}'. Must be one of: {}",
                MEAL_TYPES.join(", ")
            ),
        };
        Ok(meal_type)
    }
}

impl fmt::Display for MealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Meal plans ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroSnapshot {
    pub calories: f64,
    pub protein_g: f64,
    pub carbohydrates_g: f64,
    pub fat_g: f64,
}

impl MacroSnapshot {
    /// Scale per-100-unit nutrition values to `quantity` units.
    #[must_use]
    pub fn scaled(per_100: &MacroSnapshot, quantity: f64) -> Self {
        let factor = quantity / 100.0;
        Self {
            calories: per_100.calories * factor,
            protein_g: per_100.protein_g * factor,
            carbohydrates_g: per_100.carbohydrates_g * factor,
            fat_g: per_100.fat_g * factor,
        }
    }

    pub fn add(&mut self, other: &MacroSnapshot) {
        self.calories += other.calories;
        self.protein_g += other.protein_g;
        self.carbohydrates_g += other.carbohydrates_g;
        self.fat_g += other.fat_g;
    }
}

fn default_unit() -> String {
    "g".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlanItem {
    pub day_of_week: DayOfWeek,
    pub meal_type: MealType,
    #[serde(deserialize_with = "string_or_number")]
    pub meal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meal_name: Option<String>,
    pub quantity: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macros: Option<MacroSnapshot>,
}

impl MealPlanItem {
    /// Build an item, snapshotting macros from per-100-unit values when given.
    pub fn new(
        day_of_week: DayOfWeek,
        meal_type: MealType,
        meal_id: &str,
        quantity: f64,
        unit: Option<&str>,
        per_100: Option<&MacroSnapshot>,
    ) -> Result<Self> {
        if meal_id.trim().is_empty() {
            bail!("Meal reference must not be empty");
        }
        if !(quantity > 0.0 && quantity.is_finite()) {
            bail!("Quantity must be greater than 0");
        }
        let unit = unit
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map_or_else(default_unit, str::to_string);
        Ok(Self {
            day_of_week,
            meal_type,
            meal_id: meal_id.trim().to_string(),
            meal_name: None,
            quantity,
            unit,
            macros: per_100.map(|p| MacroSnapshot::scaled(p, quantity)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlan {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub items: Vec<MealPlanItem>,
    #[serde(default)]
    pub target_calories: Option<f64>,
    #[serde(default)]
    pub target_protein_g: Option<f64>,
    #[serde(default)]
    pub target_carbs_g: Option<f64>,
    #[serde(default)]
    pub target_fat_g: Option<f64>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl MealPlan {
    /// Synthesize a plan that exists only on this device.
    #[must_use]
    pub fn new_local(data: &NewMealPlan) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: EntityId::new_local(),
            name: data.name.trim().to_string(),
            description: data.description.clone(),
            is_active: data.is_active,
            items: data.items.clone(),
            target_calories: data.target_calories,
            target_protein_g: data.target_protein_g,
            target_carbs_g: data.target_carbs_g,
            target_fat_g: data.target_fat_g,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[must_use]
    pub fn provenance(&self) -> Provenance {
        self.id.provenance()
    }

    pub fn apply_update(&mut self, update: &UpdateMealPlan) {
        if let Some(name) = &update.name {
            self.name = name.trim().to_string();
        }
        if let Some(description) = &update.description {
            self.description.clone_from(description);
        }
        if let Some(active) = update.is_active {
            self.is_active = active;
        }
        if let Some(items) = &update.items {
            self.items.clone_from(items);
        }
        if let Some(v) = update.target_calories {
            self.target_calories = v;
        }
        if let Some(v) = update.target_protein_g {
            self.target_protein_g = v;
        }
        if let Some(v) = update.target_carbs_g {
            self.target_carbs_g = v;
        }
        if let Some(v) = update.target_fat_g {
            self.target_fat_g = v;
        }
        self.updated_at = Utc::now().to_rfc3339();
    }

    /// Request body that recreates this plan on the server.
    #[must_use]
    pub fn to_new(&self) -> NewMealPlan {
        NewMealPlan {
            name: self.name.clone(),
            description: self.description.clone(),
            is_active: self.is_active,
            items: self.items.clone(),
            target_calories: self.target_calories,
            target_protein_g: self.target_protein_g,
            target_carbs_g: self.target_carbs_g,
            target_fat_g: self.target_fat_g,
        }
    }

    /// Sum of item snapshots scheduled on `day`. Items without a snapshot count as zero.
    #[must_use]
    pub fn day_totals(&self, day: DayOfWeek) -> MacroSnapshot {
        let mut totals = MacroSnapshot::default();
        for item in self.items.iter().filter(|i| i.day_of_week == day) {
            if let Some(m) = &item.macros {
                totals.add(m);
            }
        }
        totals
    }

    /// Per-day totals, Monday first.
    #[must_use]
    pub fn week_totals(&self) -> [MacroSnapshot; 7] {
        DayOfWeek::ALL.map(|d| self.day_totals(d))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMealPlan {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub items: Vec<MealPlanItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_protein_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_carbs_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_fat_g: Option<f64>,
}

/// Partial update. The outer `Option` means "leave unchanged"; an inner
/// `None` clears the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[allow(clippy::option_option)]
pub struct UpdateMealPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<MealPlanItem>>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_calories: Option<Option<f64>>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_protein_g: Option<Option<f64>>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_carbs_g: Option<Option<f64>>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_fat_g: Option<Option<f64>>,
}

impl UpdateMealPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.is_active.is_none()
            && self.items.is_none()
            && self.target_calories.is_none()
            && self.target_protein_g.is_none()
            && self.target_carbs_g.is_none()
            && self.target_fat_g.is_none()
    }
}

fn validate_target(label: &str, value: Option<f64>) -> Result<()> {
    if let Some(v) = value
        && !(v >= 0.0 && v.is_finite())
    {
        bail!("{label} must not be negative");
    }
    Ok(())
}

fn validate_items(items: &[MealPlanItem]) -> Result<()> {
    for item in items {
        if !(item.quantity > 0.0 && item.quantity.is_finite()) {
            bail!(
                "Quantity for meal '{}' on {} must be greater than 0",
                item.meal_id,
                item.day_of_week
            );
        }
    }
    Ok(())
}

/// Client-side checks run before any request is issued.
pub fn validate_new_meal_plan(data: &NewMealPlan) -> Result<()> {
    if data.name.trim().is_empty() {
        bail!("Meal plan name must not be empty");
    }
    validate_items(&data.items)?;
    validate_target("target_calories", data.target_calories)?;
    validate_target("target_protein_g", data.target_protein_g)?;
    validate_target("target_carbs_g", data.target_carbs_g)?;
    validate_target("target_fat_g", data.target_fat_g)?;
    Ok(())
}

pub fn validate_update_meal_plan(data: &UpdateMealPlan) -> Result<()> {
    if data.is_empty() {
        bail!("Nothing to update");
    }
    if data.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        bail!("Meal plan name must not be empty");
    }
    if let Some(items) = &data.items {
        validate_items(items)?;
    }
    validate_target("target_calories", data.target_calories.flatten())?;
    validate_target("target_protein_g", data.target_protein_g.flatten())?;
    validate_target("target_carbs_g", data.target_carbs_g.flatten())?;
    validate_target("target_fat_g", data.target_fat_g.flatten())?;
    Ok(())
}

// --- Response envelopes ---

/// Every body shape the list endpoint is known to return.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MealPlanListResponse {
    Bare(Vec<MealPlan>),
    Wrapped {
        meal_plans: Vec<MealPlan>,
    },
    Data {
        success: bool,
        #[serde(default)]
        data: Vec<MealPlan>,
        #[serde(default)]
        message: Option<String>,
    },
    Single(MealPlan),
}

/// Every body shape the single-plan endpoints are known to return.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MealPlanResponse {
    Wrapped {
        meal_plan: MealPlan,
    },
    Data {
        success: bool,
        data: Option<MealPlan>,
        #[serde(default)]
        message: Option<String>,
    },
    Bare(MealPlan),
}

impl MealPlanListResponse {
    /// Parse a raw body; anything outside the known shapes is an error.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ApiError::UnexpectedShape(format!("meal plan list: {e}")).into())
    }

    /// Flatten to a plan list. `accept_single_object` controls whether a lone
    /// plan object counts as a one-element list.
    pub fn into_plans(self, accept_single_object: bool) -> Result<Vec<MealPlan>> {
        match self {
            MealPlanListResponse::Bare(plans)
            | MealPlanListResponse::Wrapped { meal_plans: plans } => Ok(plans),
            MealPlanListResponse::Data {
                success: true,
                data,
                ..
            } => Ok(data),
            MealPlanListResponse::Data {
                success: false,
                message,
                ..
            } => Err(backend_failure(message)),
            MealPlanListResponse::Single(plan) => {
                if accept_single_object {
                    Ok(vec![plan])
                } else {
                    Err(ApiError::UnexpectedShape(
                        "meal plan list: got a single object".to_string(),
                    )
                    .into())
                }
            }
        }
    }
}

impl MealPlanResponse {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ApiError::UnexpectedShape(format!("meal plan: {e}")).into())
    }

    pub fn into_plan(self) -> Result<MealPlan> {
        match self {
            MealPlanResponse::Wrapped { meal_plan: plan } | MealPlanResponse::Bare(plan) => {
                Ok(plan)
            }
            MealPlanResponse::Data {
                success: true,
                data: Some(plan),
                ..
            } => Ok(plan),
            MealPlanResponse::Data {
                success: true,
                data: None,
                ..
            } => Err(ApiError::UnexpectedShape("meal plan: empty data".to_string()).into()),
            MealPlanResponse::Data {
                success: false,
                message,
                ..
            } => Err(backend_failure(message)),
        }
    }
}

pub(crate) fn backend_failure(message: Option<String>) -> anyhow::Error {
    ApiError::Backend(message.unwrap_or_else(|| "request was not successful".to_string())).into()
}
