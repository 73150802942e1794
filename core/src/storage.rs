use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Key holding the local replica of meal plans (JSON array).
pub const MEAL_PLANS_KEY: &str = "fittrack.meal_plans";
/// Key holding the last nutrition profile fetched or saved.
pub const NUTRITION_PROFILE_KEY: &str = "fittrack.nutrition_profile";
const COMPLETED_MEALS_PREFIX: &str = "fittrack.completed_meals.";
pub const CALORIE_NOTE_PREFIX: &str = "fittrack.calorie_note.";

#[must_use]
pub fn completed_meals_key(date: NaiveDate) -> String {
    format!("{COMPLETED_MEALS_PREFIX}{}", date.format("%Y-%m-%d"))
}

#[must_use]
pub fn calorie_note_key(date: NaiveDate) -> String {
    format!("{CALORIE_NOTE_PREFIX}{}", date.format("%Y-%m-%d"))
}

/// Durable string key-value store shared by every feature of the client.
///
/// There is no locking between writers; the last write to a key wins.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Returns whether a value was removed.
    fn remove(&self, key: &str) -> Result<bool>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and decode a JSON value. A value that no longer decodes is treated as
/// absent so a corrupted entry cannot wedge the caller.
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            tracing::warn!(key, error = %e, "discarding undecodable local value");
            Ok(None)
        }
    }
}

pub fn set_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)
        .with_context(|| format!("Failed to encode local value for '{key}'"))?;
    store.set(key, &raw)
}
