//! Meal plans cached across the remote API and the local store.
//!
//! The remote API is preferred for every operation. When it cannot be reached
//! the local replica answers reads and absorbs writes, and records created
//! offline get a `local-` id so later updates and deletes stay on this device.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::models::{
    EntityId, MealPlan, MealPlanListResponse, MealPlanResponse, NewMealPlan, UpdateMealPlan,
    validate_new_meal_plan, validate_update_meal_plan,
};
use crate::storage::{KeyValueStore, MEAL_PLANS_KEY, get_json, set_json};

/// Remote half of the cache. `id` arguments are always server-issued ids.
#[async_trait]
pub trait MealPlanRemote: Send + Sync {
    async fn list(&self) -> Result<MealPlanListResponse>;
    async fn get(&self, id: &str) -> Result<MealPlanResponse>;
    async fn create(&self, data: &NewMealPlan) -> Result<MealPlanResponse>;
    async fn update(&self, id: &str, data: &UpdateMealPlan) -> Result<MealPlanResponse>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// What happens to local-only plans when a full list fetch succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePolicy {
    /// Local replica becomes exactly the remote snapshot. Plans created while
    /// offline and never pushed are dropped.
    #[default]
    ReplaceWithRemote,
    /// Remote snapshot plus any local-only plans still waiting to be pushed.
    KeepLocalOnly,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub remote_timeout: Duration,
    /// Treat a lone plan object from the list endpoint as a one-element list.
    pub accept_single_object: bool,
    pub reconcile: ReconcilePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(5),
            accept_single_object: true,
            reconcile: ReconcilePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Remote,
    Local,
}

#[derive(Debug, Clone, Serialize)]
pub struct MealPlanList {
    pub plans: Vec<MealPlan>,
    pub source: DataSource,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// `(local id, server id)` for every plan the server accepted.
    pub pushed: Vec<(EntityId, EntityId)>,
    pub failed: Vec<(EntityId, String)>,
}

pub struct MealPlanService<R, S> {
    remote: R,
    store: Mutex<S>,
    config: CacheConfig,
}

impl<R: MealPlanRemote, S: KeyValueStore> MealPlanService<R, S> {
    pub fn new(remote: R, store: S) -> Self {
        Self::with_config(remote, store, CacheConfig::default())
    }

    pub fn with_config(remote: R, store: S, config: CacheConfig) -> Self {
        Self {
            remote,
            store: Mutex::new(store),
            config,
        }
    }

    // --- Operations ---

    /// List plans, optionally keeping only active (`Some(true)`) or inactive ones.
    pub async fn get_all(&self, active: Option<bool>) -> Result<MealPlanList> {
        let fetched = self
            .remote_call(self.remote.list())
            .await
            .and_then(|r| r.into_plans(self.config.accept_single_object));

        let (plans, source) = match fetched {
            Ok(remote_plans) => (self.reconcile(remote_plans)?, DataSource::Remote),
            Err(e) => {
                debug!(error = %e, "meal plan list unavailable remotely, using local replica");
                (self.read_local()?, DataSource::Local)
            }
        };

        let plans = match active {
            Some(want) => plans.into_iter().filter(|p| p.is_active == want).collect(),
            None => plans,
        };
        Ok(MealPlanList { plans, source })
    }

    pub async fn get_by_id(&self, id: &EntityId) -> Result<MealPlan> {
        match id {
            EntityId::Local(_) => self
                .find_local(id)?
                .ok_or_else(|| not_found(id)),
            EntityId::Remote(remote_id) => {
                let fetched = self
                    .remote_call(self.remote.get(remote_id))
                    .await
                    .and_then(MealPlanResponse::into_plan);
                match fetched {
                    Ok(plan) => Ok(plan),
                    Err(e) => {
                        debug!(%id, error = %e, "meal plan fetch failed, trying local replica");
                        self.find_local(id)?.ok_or(e)
                    }
                }
            }
        }
    }

    /// Create a plan. When the server is unreachable the plan is kept locally
    /// under a fresh `local-` id; check `plan.id` to tell the two apart.
    pub async fn create(&self, data: &NewMealPlan) -> Result<MealPlan> {
        validate_new_meal_plan(data)?;

        let created = self
            .remote_call(self.remote.create(data))
            .await
            .and_then(MealPlanResponse::into_plan);

        match created {
            Ok(plan) => {
                if let Err(e) = self.upsert_local(plan.clone()) {
                    warn!(id = %plan.id, error = %e, "created plan not mirrored locally");
                }
                Ok(plan)
            }
            Err(remote_err) => {
                let plan = MealPlan::new_local(data);
                warn!(id = %plan.id, error = %remote_err, "server unavailable, plan saved locally");
                match self.upsert_local(plan.clone()) {
                    Ok(()) => Ok(plan),
                    Err(local_err) => {
                        warn!(error = %local_err, "local fallback for create failed");
                        Err(remote_err)
                    }
                }
            }
        }
    }

    pub async fn update(&self, id: &EntityId, data: &UpdateMealPlan) -> Result<MealPlan> {
        validate_update_meal_plan(data)?;

        match id {
            EntityId::Local(_) => self.update_local(id, data),
            EntityId::Remote(remote_id) => {
                let updated = self
                    .remote_call(self.remote.update(remote_id, data))
                    .await
                    .and_then(MealPlanResponse::into_plan);
                match updated {
                    Ok(plan) => {
                        if let Err(e) = self.upsert_local(plan.clone()) {
                            warn!(%id, error = %e, "updated plan not mirrored locally");
                        }
                        Ok(plan)
                    }
                    Err(remote_err) => {
                        warn!(
                            %id,
                            error = %remote_err,
                            "server unavailable, updating local replica"
                        );
                        self.update_local(id, data).map_err(|_| remote_err)
                    }
                }
            }
        }
    }

    pub async fn delete(&self, id: &EntityId) -> Result<()> {
        match id {
            EntityId::Local(_) => {
                if self.remove_local(id)? {
                    Ok(())
                } else {
                    Err(not_found(id))
                }
            }
            EntityId::Remote(remote_id) => {
                match self.remote_call(self.remote.delete(remote_id)).await {
                    Ok(()) => {
                        if let Err(e) = self.remove_local(id) {
                            warn!(%id, error = %e, "deleted plan still in local replica");
                        }
                        Ok(())
                    }
                    Err(remote_err) => {
                        warn!(
                            %id,
                            error = %remote_err,
                            "server unavailable, deleting from local replica"
                        );
                        match self.remove_local(id) {
                            Ok(true) => Ok(()),
                            _ => Err(remote_err),
                        }
                    }
                }
            }
        }
    }

    /// Push every local-only plan to the server. Accepted plans replace their
    /// local copy; the rest stay local and are reported as failed.
    pub async fn sync_local_only(&self) -> Result<SyncReport> {
        let pending: Vec<MealPlan> = self
            .read_local()?
            .into_iter()
            .filter(|p| p.id.is_local())
            .collect();

        let mut report = SyncReport::default();
        for plan in pending {
            let pushed = self
                .remote_call(self.remote.create(&plan.to_new()))
                .await
                .and_then(MealPlanResponse::into_plan);
            match pushed {
                Ok(server_plan) => {
                    self.replace_local(&plan.id, server_plan.clone())?;
                    report.pushed.push((plan.id, server_plan.id));
                }
                Err(e) => {
                    debug!(id = %plan.id, error = %e, "local plan not pushed");
                    report.failed.push((plan.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// The local replica as it stands, without contacting the server.
    pub fn cached(&self) -> Result<Vec<MealPlan>> {
        self.read_local()
    }

    // --- Remote helpers ---

    async fn remote_call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(self.config.remote_timeout).into()),
        }
    }

    fn reconcile(&self, remote_plans: Vec<MealPlan>) -> Result<Vec<MealPlan>> {
        let plans = match self.config.reconcile {
            ReconcilePolicy::ReplaceWithRemote => remote_plans,
            ReconcilePolicy::KeepLocalOnly => {
                let mut merged = remote_plans;
                merged.extend(self.read_local()?.into_iter().filter(|p| p.id.is_local()));
                merged
            }
        };
        if let Err(e) = self.write_local(&plans) {
            warn!(error = %e, "could not refresh local meal plan replica");
        }
        Ok(plans)
    }

    // --- Local replica ---

    fn with_store<T>(&self, f: impl FnOnce(&S) -> Result<T>) -> Result<T> {
        let store = self
            .store
            .lock()
            .map_err(|_| anyhow!("local store lock poisoned"))?;
        f(&store)
    }

    fn read_local(&self) -> Result<Vec<MealPlan>> {
        self.with_store(|s| Ok(get_json(s, MEAL_PLANS_KEY)?.unwrap_or_default()))
    }

    fn write_local(&self, plans: &[MealPlan]) -> Result<()> {
        self.with_store(|s| set_json(s, MEAL_PLANS_KEY, plans))
    }

    fn find_local(&self, id: &EntityId) -> Result<Option<MealPlan>> {
        Ok(self.read_local()?.into_iter().find(|p| &p.id == id))
    }

    fn upsert_local(&self, plan: MealPlan) -> Result<()> {
        let mut plans = self.read_local()?;
        match plans.iter_mut().find(|p| p.id == plan.id) {
            Some(existing) => *existing = plan,
            None => plans.push(plan),
        }
        self.write_local(&plans)
    }

    fn replace_local(&self, old_id: &EntityId, plan: MealPlan) -> Result<()> {
        let mut plans = self.read_local()?;
        plans.retain(|p| &p.id != old_id && p.id != plan.id);
        plans.push(plan);
        self.write_local(&plans)
    }

    fn update_local(&self, id: &EntityId, data: &UpdateMealPlan) -> Result<MealPlan> {
        let mut plans = self.read_local()?;
        let plan = plans
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| not_found(id))?;
        plan.apply_update(data);
        let updated = plan.clone();
        self.write_local(&plans)?;
        Ok(updated)
    }

    fn remove_local(&self, id: &EntityId) -> Result<bool> {
        let mut plans = self.read_local()?;
        let before = plans.len();
        plans.retain(|p| &p.id != id);
        if plans.len() == before {
            return Ok(false);
        }
        self.write_local(&plans)?;
        Ok(true)
    }
}

fn not_found(id: &EntityId) -> anyhow::Error {
    ApiError::not_found(format!("meal plan {id}")).into()
}
