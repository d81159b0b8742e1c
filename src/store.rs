//! Aggregate store: the dashboard's single source of truth.
//!
//! [`FarmData`] holds the nine dashboard collections in memory, refreshes all
//! of them whenever any one changes, and passes mutations straight through to
//! the backing store. Mutations never touch the in-memory copy; the change
//! feed brings it up to date shortly after the write lands.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::models::{
    DiagnosticResult, Field, FieldUpdate, ForecastDay, MaintenanceTask, NewField, NewForecastDay,
    NewNotification, NewTask, NewUser, NewWeatherSnapshot, Notification, SystemStatus, Task,
    TaskUpdate, User, UserUpdate, WeatherSnapshot,
};
use crate::query::{fetch, fetch_by_id, fetch_one, presets, QueryOptions};
use crate::schema::Collection;
use crate::storage::CollectionStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorePhase {
    #[default]
    Uninitialized,
    Loading,
    Ready,
    Error,
}

/// The nine slices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub users: Vec<User>,
    pub fields: Vec<Field>,
    pub tasks: Vec<Task>,
    pub notifications: Vec<Notification>,
    /// Most recent reading; `None` until one is recorded.
    pub weather: Option<WeatherSnapshot>,
    pub forecast: Vec<ForecastDay>,
    pub system_status: Vec<SystemStatus>,
    pub diagnostic_results: Vec<DiagnosticResult>,
    pub maintenance_tasks: Vec<MaintenanceTask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardState {
    pub phase: StorePhase,
    pub loading: bool,
    /// First failed read of the last refresh. Slices that failed keep their
    /// previous contents.
    pub error: Option<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub data: Snapshot,
}

struct Inner {
    store: Arc<dyn CollectionStore>,
    state: watch::Sender<DashboardState>,
    /// Refreshes never overlap, so the last one to finish is also the last
    /// one started and slices from two refreshes are never mixed.
    refresh_lock: Mutex<()>,
}

/// Constructed, explicitly owned dashboard store. Share it behind an `Arc`.
pub struct FarmData {
    inner: Arc<Inner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl FarmData {
    /// Subscribe to the nine collections, load them once, then keep them
    /// fresh: any change to any of them triggers a full refresh. Bursts of
    /// notifications that arrive while a refresh runs collapse into a single
    /// follow-up refresh.
    ///
    /// A failing first load does not fail `open`; it shows up in the state.
    pub async fn open(store: Arc<dyn CollectionStore>) -> Self {
        let (state, _) = watch::channel(DashboardState::default());
        let inner = Arc::new(Inner {
            store,
            state,
            refresh_lock: Mutex::new(()),
        });

        let subscriptions: Vec<_> = Collection::AGGREGATE
            .iter()
            .map(|collection| inner.store.subscribe(*collection))
            .collect();

        if let Err(e) = inner.refresh().await {
            warn!(error = %e, "initial dashboard load incomplete");
        }

        let (signal_tx, mut signal_rx) = mpsc::channel::<Collection>(1);
        let mut tasks = Vec::with_capacity(subscriptions.len() + 1);
        for mut subscription in subscriptions {
            let signal = signal_tx.clone();
            tasks.push(tokio::spawn(async move {
                let collection = subscription.collection();
                while subscription.changed().await {
                    subscription.drain_pending();
                    match signal.try_send(collection) {
                        // Full: a refresh is already queued and will see this change.
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }));
        }
        drop(signal_tx);

        let refresher = Arc::clone(&inner);
        tasks.push(tokio::spawn(async move {
            while let Some(trigger) = signal_rx.recv().await {
                debug!(trigger = %trigger, "change notification, refreshing dashboard");
                // failures are recorded in the state
                let _ = refresher.refresh().await;
            }
        }));

        info!(collections = Collection::AGGREGATE.len(), "dashboard store open");
        Self {
            inner,
            tasks: StdMutex::new(tasks),
        }
    }

    /// Re-read all nine collections now.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    pub fn state(&self) -> DashboardState {
        self.inner.state.borrow().clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.state.borrow().data.clone()
    }

    /// Receiver that wakes on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<DashboardState> {
        self.inner.state.subscribe()
    }

    /// The backing store, for ad-hoc reads and live queries.
    pub fn store(&self) -> Arc<dyn CollectionStore> {
        Arc::clone(&self.inner.store)
    }

    /// Close the nine subscriptions and stop refreshing. Idempotent.
    pub fn dispose(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("dashboard store disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    // --- users ---

    pub async fn user(&self, id: &str) -> Result<User> {
        fetch_by_id(self.inner.store.as_ref(), Collection::Users, id).await
    }

    pub async fn create_user(&self, user: NewUser) -> Result<User> {
        self.create(Collection::Users, &user).await
    }

    pub async fn update_user(&self, id: &str, update: UserUpdate) -> Result<User> {
        self.update(Collection::Users, id, &update).await
    }

    pub async fn delete_user(&self, id: &str) -> Result<bool> {
        self.delete(Collection::Users, id).await
    }

    // --- fields ---

    pub async fn field(&self, id: &str) -> Result<Field> {
        fetch_by_id(self.inner.store.as_ref(), Collection::Fields, id).await
    }

    pub async fn create_field(&self, field: NewField) -> Result<Field> {
        field.validate()?;
        self.create(Collection::Fields, &field).await
    }

    pub async fn update_field(&self, id: &str, update: FieldUpdate) -> Result<Field> {
        update.validate()?;
        self.update(Collection::Fields, id, &update).await
    }

    pub async fn delete_field(&self, id: &str) -> Result<bool> {
        self.delete(Collection::Fields, id).await
    }

    // --- tasks ---

    pub async fn task(&self, id: &str) -> Result<Task> {
        fetch_by_id(self.inner.store.as_ref(), Collection::Tasks, id).await
    }

    pub async fn create_task(&self, task: NewTask) -> Result<Task> {
        self.create(Collection::Tasks, &task).await
    }

    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        self.update(Collection::Tasks, id, &update).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        self.delete(Collection::Tasks, id).await
    }

    // --- notifications ---

    pub async fn create_notification(&self, notification: NewNotification) -> Result<Notification> {
        self.create(Collection::Notifications, &notification).await
    }

    /// Idempotent: marking an already-read notification succeeds again.
    pub async fn mark_notification_as_read(&self, id: &str) -> Result<Notification> {
        self.update(Collection::Notifications, id, &json!({ "read": true }))
            .await
    }

    /// Mark every notification addressed to `user_id` as read.
    pub async fn clear_all_notifications(&self, user_id: &str) -> Result<bool> {
        let cleared = self
            .inner
            .store
            .update_where(
                Collection::Notifications,
                "user_id",
                &json!(user_id),
                json!({ "read": true }),
            )
            .await?;
        info!(user_id, cleared, "notifications cleared");
        Ok(true)
    }

    // --- weather ---

    /// Store a new reading and replace the forecast with `forecast`.
    ///
    /// All input is checked before anything is written, and the forecast is
    /// swapped in one store write, so a failure leaves the old forecast.
    pub async fn record_weather(
        &self,
        snapshot: NewWeatherSnapshot,
        forecast: Vec<NewForecastDay>,
    ) -> Result<WeatherSnapshot> {
        snapshot.validate()?;
        let mut days = Vec::with_capacity(forecast.len());
        for day in &forecast {
            day.validate()?;
            days.push(serde_json::to_value(day)?);
        }

        let replaced = self.inner.store.replace_all(Collection::Forecast, days).await?;
        let recorded: WeatherSnapshot = self.create(Collection::Weather, &snapshot).await?;
        info!(days = replaced.len(), "weather recorded");
        Ok(recorded)
    }

    async fn create<I, T>(&self, collection: Collection, input: &I) -> Result<T>
    where
        I: Serialize + Sync,
        T: DeserializeOwned,
    {
        let row = serde_json::to_value(input)?;
        let stored = self.inner.store.insert(collection, row).await?;
        info!(collection = %collection, id = %stored["id"], "row created");
        Ok(serde_json::from_value(stored)?)
    }

    async fn update<P, T>(&self, collection: Collection, id: &str, patch: &P) -> Result<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let patch = serde_json::to_value(patch)?;
        let stored = self.inner.store.update(collection, id, patch).await?;
        info!(collection = %collection, id, "row updated");
        Ok(serde_json::from_value(stored)?)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        self.inner.store.delete(collection, id).await?;
        info!(collection = %collection, id, "row deleted");
        Ok(true)
    }
}

impl Drop for FarmData {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.state.send_modify(|state| {
            state.loading = true;
            state.phase = StorePhase::Loading;
        });

        let store = self.store.as_ref();
        let everything = QueryOptions::new();
        let notifications_newest = presets::notifications(None);
        let latest_weather = presets::latest_weather();
        let diagnostics_newest = presets::diagnostic_results();

        let (
            users,
            fields,
            tasks,
            notifications,
            weather,
            forecast,
            system_status,
            diagnostic_results,
            maintenance_tasks,
        ) = tokio::join!(
            fetch::<User>(store, Collection::Users, &everything),
            fetch::<Field>(store, Collection::Fields, &everything),
            fetch::<Task>(store, Collection::Tasks, &everything),
            fetch::<Notification>(store, Collection::Notifications, &notifications_newest),
            fetch_one::<WeatherSnapshot>(store, Collection::Weather, &latest_weather),
            fetch::<ForecastDay>(store, Collection::Forecast, &everything),
            fetch::<SystemStatus>(store, Collection::SystemStatus, &everything),
            fetch::<DiagnosticResult>(store, Collection::DiagnosticResults, &diagnostics_newest),
            fetch::<MaintenanceTask>(store, Collection::MaintenanceTasks, &everything),
        );

        // Often empty early on; never a store-level error. A failed read keeps
        // the last reading, an empty table clears it.
        let weather = match weather {
            Ok(weather) => Some(weather),
            Err(e) => {
                warn!(error = %e, "weather read failed, keeping last reading");
                None
            }
        };

        let mut failures: Vec<(Collection, SyncError)> = Vec::new();
        self.state.send_modify(|state| {
            let data = &mut state.data;
            apply(&mut data.users, users, Collection::Users, &mut failures);
            apply(&mut data.fields, fields, Collection::Fields, &mut failures);
            apply(&mut data.tasks, tasks, Collection::Tasks, &mut failures);
            apply(
                &mut data.notifications,
                notifications,
                Collection::Notifications,
                &mut failures,
            );
            if let Some(weather) = weather {
                data.weather = weather;
            }
            apply(&mut data.forecast, forecast, Collection::Forecast, &mut failures);
            apply(
                &mut data.system_status,
                system_status,
                Collection::SystemStatus,
                &mut failures,
            );
            apply(
                &mut data.diagnostic_results,
                diagnostic_results,
                Collection::DiagnosticResults,
                &mut failures,
            );
            apply(
                &mut data.maintenance_tasks,
                maintenance_tasks,
                Collection::MaintenanceTasks,
                &mut failures,
            );

            state.error = failures
                .first()
                .map(|(collection, e)| format!("{}: {}", collection, e));
            state.phase = if failures.is_empty() {
                StorePhase::Ready
            } else {
                StorePhase::Error
            };
            state.loading = false;
            state.refreshed_at = Some(Utc::now());
        });

        match failures.into_iter().next() {
            None => {
                debug!("dashboard refreshed");
                Ok(())
            }
            Some((collection, e)) => {
                warn!(collection = %collection, error = %e, "dashboard refresh incomplete, keeping last known data");
                Err(e)
            }
        }
    }
}

fn apply<T>(
    slot: &mut Vec<T>,
    result: Result<Vec<T>>,
    collection: Collection,
    failures: &mut Vec<(Collection, SyncError)>,
) {
    match result {
        Ok(rows) => *slot = rows,
        Err(e) => failures.push((collection, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldStatus, NotificationKind, Priority, Role, TaskStatus, UserStatus, WeatherCondition};
    use crate::storage::Storage;
    use crate::test_support::FlakyStore;
    use std::time::{Duration, Instant};

    async fn wait_for_state<F>(data: &FarmData, mut pred: F) -> DashboardState
    where
        F: FnMut(&DashboardState) -> bool,
    {
        let mut rx = data.subscribe_state();
        let wait = async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    if pred(&state) {
                        return state.clone();
                    }
                }
                rx.changed().await.expect("store alive");
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("dashboard state never converged")
    }

    fn new_user(name: &str) -> NewUser {
        NewUser {
            name: name.to_string(),
            email: format!("{}@farm.test", name.to_lowercase()),
            role: Role::Worker,
            status: UserStatus::Active,
            avatar: None,
            permissions: vec!["view_tasks".to_string()],
            farm_id: None,
        }
    }

    fn test_field(name: &str) -> NewField {
        NewField {
            name: name.to_string(),
            location: "X".to_string(),
            size: 5.0,
            crop_type: "Corn".to_string(),
            status: FieldStatus::Healthy,
            soil_moisture: 50.0,
            sunlight: 50.0,
            growth_stage: "Early".to_string(),
            planting_date: None,
            harvest_date: None,
            field_image: None,
            farm_id: None,
        }
    }

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: None,
            field_id: None,
            field_name: "North".to_string(),
            assigned_to_id: None,
            assigned_to_name: "Ana".to_string(),
            due_date: None,
            priority: Priority::Medium,
            status: TaskStatus::Pending,
        }
    }

    fn new_notification(user_id: &str) -> NewNotification {
        NewNotification {
            title: "Irrigation due".to_string(),
            message: "North field needs water".to_string(),
            kind: NotificationKind::Task,
            status: None,
            priority: None,
            user_id: Some(user_id.to_string()),
            related_id: None,
            related_type: None,
        }
    }

    fn sunny() -> NewWeatherSnapshot {
        NewWeatherSnapshot {
            temperature: 24.0,
            humidity: 40.0,
            wind_speed: 8.0,
            condition: WeatherCondition::Sunny,
            location: "Farm Location".to_string(),
        }
    }

    #[tokio::test]
    async fn test_open_loads_and_reaches_ready() {
        let storage = Storage::temporary().expect("storage");
        let data = FarmData::open(Arc::new(storage)).await;
        let state = data.state();
        assert_eq!(state.phase, StorePhase::Ready);
        assert!(!state.loading);
        assert!(state.error.is_none());
        assert!(state.refreshed_at.is_some());
        assert_eq!(state.data, Snapshot::default());
    }

    #[tokio::test]
    async fn test_create_field_shows_up_after_notification() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage)).await;

        let created = data.create_field(test_field("Test Field")).await?;
        assert_eq!(created.name, "Test Field");

        let state = wait_for_state(&data, |s| s.data.fields.len() == 1).await;
        assert_eq!(state.data.fields[0].name, "Test Field");
        assert_eq!(state.data.fields[0].id, created.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_user_touches_only_that_user() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage)).await;
        let first = data.create_user(new_user("Ana")).await?;
        let second = data.create_user(new_user("Ben")).await?;

        data.update_user(
            &first.id,
            UserUpdate {
                status: Some(UserStatus::Inactive),
                ..Default::default()
            },
        )
        .await?;

        let state = wait_for_state(&data, |s| {
            s.data
                .users
                .iter()
                .any(|u| u.id == first.id && u.status == UserStatus::Inactive)
        })
        .await;
        let other = state.data.users.iter().find(|u| u.id == second.id).expect("second user");
        assert_eq!(other.status, UserStatus::Active);
        assert_eq!(state.data.users.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_task_is_an_error() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage)).await;
        let err = data.delete_task("no-such-task").await.unwrap_err();
        assert!(err.is_not_found());

        let task = data.create_task(new_task("Fix fence")).await?;
        assert!(data.delete_task(&task.id).await?);
        assert!(data.task(&task.id).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_mark_as_read_is_idempotent() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage)).await;
        let n = data.create_notification(new_notification("u1")).await?;
        assert!(!n.read);

        assert!(data.mark_notification_as_read(&n.id).await?.read);
        assert!(data.mark_notification_as_read(&n.id).await?.read);
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_all_leaves_no_unread_for_that_user() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage.clone())).await;
        for user in ["u1", "u1", "u2"] {
            data.create_notification(new_notification(user)).await?;
        }
        assert!(data.clear_all_notifications("u1").await?);

        let unread: Vec<Notification> = fetch::<Notification>(
            &storage,
            Collection::Notifications,
            &QueryOptions::new().filter("user_id", "u1"),
        )
        .await?
        .into_iter()
        .filter(|n: &Notification| !n.read)
        .collect();
        assert!(unread.is_empty());

        let state = wait_for_state(&data, |s| {
            s.data.notifications.len() == 3 && s.data.notifications.iter().filter(|n| n.read).count() == 2
        })
        .await;
        let still_unread: Vec<_> = state.data.notifications.iter().filter(|n| !n.read).collect();
        assert_eq!(still_unread.len(), 1);
        assert_eq!(still_unread[0].user_id.as_deref(), Some("u2"));

        // nothing to clear is still a success
        assert!(data.clear_all_notifications("nobody").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_weather_failure_is_not_a_store_error() -> Result<()> {
        let storage = Storage::temporary()?;
        let flaky = Arc::new(FlakyStore::new(storage.clone(), Duration::ZERO));
        flaky.fail(Collection::Weather, true);
        storage.insert(Collection::Users, serde_json::to_value(new_user("Ana"))?).await?;
        storage.insert(Collection::Fields, serde_json::to_value(test_field("North"))?).await?;

        let data = FarmData::open(flaky.clone()).await;
        data.refresh().await?;
        let state = data.state();
        assert_eq!(state.phase, StorePhase::Ready);
        assert!(state.error.is_none());
        assert!(state.data.weather.is_none());
        assert_eq!(state.data.users.len(), 1);
        assert_eq!(state.data.fields.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_slice_keeps_last_known_data() -> Result<()> {
        let storage = Storage::temporary()?;
        let flaky = Arc::new(FlakyStore::new(storage.clone(), Duration::ZERO));
        storage.insert(Collection::Fields, serde_json::to_value(test_field("North"))?).await?;
        let data = FarmData::open(flaky.clone()).await;
        assert_eq!(data.snapshot().fields.len(), 1);

        flaky.fail(Collection::Fields, true);
        storage.insert(Collection::Fields, serde_json::to_value(test_field("South"))?).await?;
        storage.insert(Collection::Users, serde_json::to_value(new_user("Ana"))?).await?;

        let err = data.refresh().await.unwrap_err();
        assert!(matches!(err, SyncError::Unavailable(_)));
        let state = data.state();
        assert_eq!(state.phase, StorePhase::Error);
        assert!(state.error.as_deref().unwrap_or_default().starts_with("fields"));
        assert_eq!(state.data.fields.len(), 1, "stale fields stay on screen");
        assert_eq!(state.data.users.len(), 1, "healthy slices still update");

        flaky.fail(Collection::Fields, false);
        data.refresh().await?;
        let state = data.state();
        assert_eq!(state.phase, StorePhase::Ready);
        assert!(state.error.is_none());
        assert_eq!(state.data.fields.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_reads_run_concurrently() -> Result<()> {
        let delay = Duration::from_millis(100);
        let storage = Storage::temporary()?;
        let flaky = Arc::new(FlakyStore::new(storage, delay));
        let data = FarmData::open(flaky).await;

        let started = Instant::now();
        data.refresh().await?;
        let elapsed = started.elapsed();
        // nine sequential reads would take at least 900ms
        assert!(elapsed < delay * 5, "refresh took {:?}", elapsed);
        Ok(())
    }

    #[tokio::test]
    async fn test_aggregate_converges_to_direct_reads() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage.clone())).await;

        let ana = data.create_user(new_user("Ana")).await?;
        let field = data.create_field(test_field("North")).await?;
        let task = data.create_task(new_task("Scout pests")).await?;
        data.update_task(
            &task.id,
            TaskUpdate {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        )
        .await?;
        data.update_field(
            &field.id,
            FieldUpdate {
                status: Some(FieldStatus::Warning),
                ..Default::default()
            },
        )
        .await?;
        let n = data.create_notification(new_notification(&ana.id)).await?;
        data.mark_notification_as_read(&n.id).await?;
        data.record_weather(
            sunny(),
            vec![NewForecastDay {
                day: "Mon".to_string(),
                temperature: 21.0,
                condition: WeatherCondition::Cloudy,
            }],
        )
        .await?;
        data.delete_user(&ana.id).await?;

        let expected = Snapshot {
            users: fetch(&storage, Collection::Users, &QueryOptions::new()).await?,
            fields: fetch(&storage, Collection::Fields, &QueryOptions::new()).await?,
            tasks: fetch(&storage, Collection::Tasks, &QueryOptions::new()).await?,
            notifications: fetch(&storage, Collection::Notifications, &presets::notifications(None)).await?,
            weather: fetch_one(&storage, Collection::Weather, &presets::latest_weather()).await?,
            forecast: fetch(&storage, Collection::Forecast, &QueryOptions::new()).await?,
            system_status: fetch(&storage, Collection::SystemStatus, &QueryOptions::new()).await?,
            diagnostic_results: fetch(&storage, Collection::DiagnosticResults, &presets::diagnostic_results())
                .await?,
            maintenance_tasks: fetch(&storage, Collection::MaintenanceTasks, &QueryOptions::new()).await?,
        };
        assert!(expected.users.is_empty());
        assert_eq!(expected.tasks[0].status, TaskStatus::InProgress);

        let state = wait_for_state(&data, |s| s.data == expected && !s.loading).await;
        assert_eq!(state.phase, StorePhase::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_weather_replaces_forecast() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage.clone())).await;
        let days = |names: &[&str]| -> Vec<NewForecastDay> {
            names
                .iter()
                .map(|d| NewForecastDay {
                    day: d.to_string(),
                    temperature: 20.0,
                    condition: WeatherCondition::Rainy,
                })
                .collect()
        };

        data.record_weather(sunny(), days(&["Mon", "Tue", "Wed"])).await?;
        let latest = data.record_weather(sunny(), days(&["Thu", "Fri"])).await?;

        let state = wait_for_state(&data, |s| {
            s.data.weather.as_ref().map(|w| w.id.as_str()) == Some(latest.id.as_str())
                && s.data.forecast.len() == 2
        })
        .await;
        let labels: Vec<&str> = state.data.forecast.iter().map(|d| d.day.as_str()).collect();
        assert_eq!(labels, vec!["Thu", "Fri"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_weather_with_bad_day_keeps_old_forecast() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage.clone())).await;
        let day = |name: &str, temperature: f64| NewForecastDay {
            day: name.to_string(),
            temperature,
            condition: WeatherCondition::Cloudy,
        };
        let first = data
            .record_weather(sunny(), vec![day("Mon", 20.0), day("Tue", 21.0)])
            .await?;

        let err = data
            .record_weather(sunny(), vec![day("Wed", 19.0), day("Thu", f64::NAN)])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
        let mut soaked = sunny();
        soaked.humidity = 140.0;
        let err = data.record_weather(soaked, vec![day("Wed", 19.0)]).await.unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));

        data.refresh().await?;
        let state = data.state();
        let labels: Vec<&str> = state.data.forecast.iter().map(|d| d.day.as_str()).collect();
        assert_eq!(labels, vec!["Mon", "Tue"]);
        assert_eq!(state.data.weather.as_ref().map(|w| w.id.as_str()), Some(first.id.as_str()));
        assert_eq!(storage.len(Collection::Weather), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_weather_read_failure_keeps_last_reading() -> Result<()> {
        let storage = Storage::temporary()?;
        let flaky = Arc::new(FlakyStore::new(storage.clone(), Duration::ZERO));
        let data = FarmData::open(flaky.clone()).await;
        let recorded = data.record_weather(sunny(), Vec::new()).await?;
        data.refresh().await?;
        assert_eq!(data.snapshot().weather.map(|w| w.id), Some(recorded.id.clone()));

        flaky.fail(Collection::Weather, true);
        data.refresh().await?;
        let state = data.state();
        assert_eq!(state.phase, StorePhase::Ready);
        assert_eq!(state.data.weather.map(|w| w.id), Some(recorded.id.clone()));

        flaky.fail(Collection::Weather, false);
        storage.delete(Collection::Weather, &recorded.id).await?;
        data.refresh().await?;
        assert!(data.snapshot().weather.is_none(), "an empty table clears the reading");
        Ok(())
    }

    #[tokio::test]
    async fn test_rows_with_nulls_and_timestamps_still_load() -> Result<()> {
        let storage = Storage::temporary()?;
        storage
            .insert(
                Collection::Users,
                json!({
                    "name": "Ana",
                    "email": "ana@farm.test",
                    "role": "worker",
                    "status": "active",
                    "permissions": null,
                    "date_added": null
                }),
            )
            .await?;
        // no name or role: cannot be a user at all
        storage
            .insert(Collection::Users, json!({"email": "ghost@farm.test"}))
            .await?;
        storage
            .insert(
                Collection::Tasks,
                json!({
                    "title": "Irrigate",
                    "field_name": "North",
                    "assigned_to_name": "Ana",
                    "due_date": "2025-06-02T10:00:00.000Z",
                    "priority": "high",
                    "status": "pending",
                    "created_at": null
                }),
            )
            .await?;

        let data = FarmData::open(Arc::new(storage.clone())).await;
        let state = data.state();
        assert_eq!(state.phase, StorePhase::Ready);
        assert!(state.error.is_none());

        let users: Vec<User> = fetch(&storage, Collection::Users, &QueryOptions::new()).await?;
        let tasks: Vec<Task> = fetch(&storage, Collection::Tasks, &QueryOptions::new()).await?;
        assert_eq!(users.len(), 1);
        assert!(users[0].permissions.is_empty());
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].due_date,
            chrono::NaiveDate::from_ymd_opt(2025, 6, 2)
        );
        assert_eq!(state.data.users, users);
        assert_eq!(state.data.tasks, tasks);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_field_is_rejected_before_writing() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage.clone())).await;
        let mut bad = test_field("Nowhere");
        bad.size = -3.0;
        assert!(matches!(data.create_field(bad).await, Err(SyncError::Invalid(_))));
        assert!(storage.is_empty(Collection::Fields));
        Ok(())
    }

    #[tokio::test]
    async fn test_dispose_closes_subscriptions() -> Result<()> {
        let storage = Storage::temporary()?;
        let data = FarmData::open(Arc::new(storage.clone())).await;
        assert_eq!(storage.feed().listener_count(), Collection::AGGREGATE.len());
        assert!(!data.is_disposed());

        data.dispose();
        data.dispose();
        assert!(data.is_disposed());
        for _ in 0..50 {
            if storage.feed().listener_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(storage.feed().listener_count(), 0);

        // writes still go through, the in-memory copy just stops following
        data.create_user(new_user("Late")).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(data.snapshot().users.is_empty());
        Ok(())
    }
}
