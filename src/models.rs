//! Row types for every collection, plus the typed inputs used by the
//! aggregate store's create/update calls.
//!
//! Column names are the snake_case wire names. Optional inputs are skipped
//! when `None` so an update only touches the columns it names.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SyncError};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Worker,
    Technician,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Completed and cancelled tasks are shown as settled. Nothing stops a
    /// caller from moving them again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Alert,
    Task,
    Info,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WeatherCondition {
    Sunny,
    Cloudy,
    Rainy,
    Foggy,
    Snowy,
}

// --- users ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub status: UserStatus,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub date_added: Option<DateTime<Utc>>,
    #[serde(default)]
    pub farm_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub status: UserStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farm_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UserUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UserStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

// --- fields ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Field {
    pub id: String,
    pub name: String,
    pub location: String,
    /// Acres.
    pub size: f64,
    pub crop_type: String,
    pub status: FieldStatus,
    pub soil_moisture: f64,
    pub sunlight: f64,
    pub growth_stage: String,
    #[serde(default)]
    pub planting_date: Option<NaiveDate>,
    #[serde(default)]
    pub harvest_date: Option<NaiveDate>,
    #[serde(default)]
    pub field_image: Option<String>,
    #[serde(default)]
    pub farm_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewField {
    pub name: String,
    pub location: String,
    pub size: f64,
    pub crop_type: String,
    pub status: FieldStatus,
    pub soil_moisture: f64,
    pub sunlight: f64,
    pub growth_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planting_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvest_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farm_id: Option<String>,
}

impl NewField {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::invalid("field name must not be empty"));
        }
        check_size(self.size)?;
        check_percent("soil_moisture", self.soil_moisture)?;
        check_percent("sunlight", self.sunlight)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FieldStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_moisture: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunlight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub growth_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planting_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvest_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_image: Option<String>,
}

impl FieldUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.size {
            check_size(size)?;
        }
        if let Some(v) = self.soil_moisture {
            check_percent("soil_moisture", v)?;
        }
        if let Some(v) = self.sunlight {
            check_percent("sunlight", v)?;
        }
        Ok(())
    }
}

fn check_size(size: f64) -> Result<()> {
    if size.is_finite() && size > 0.0 {
        Ok(())
    } else {
        Err(SyncError::invalid(format!("field size must be positive, got {}", size)))
    }
}

fn check_finite(column: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SyncError::invalid(format!("{} must be a number, got {}", column, value)))
    }
}

fn check_percent(column: &str, value: f64) -> Result<()> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(SyncError::invalid(format!(
            "{} must be within 0-100, got {}",
            column, value
        )))
    }
}

// --- tasks ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub field_id: Option<String>,
    pub field_name: String,
    #[serde(default)]
    pub assigned_to_id: Option<String>,
    pub assigned_to_name: String,
    #[serde(default, deserialize_with = "date_or_timestamp")]
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<String>,
    pub assigned_to_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    pub status: TaskStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

// --- notifications ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub read: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub related_id: Option<String>,
    #[serde(default)]
    pub related_type: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_type: Option<String>,
}

// --- weather ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeatherSnapshot {
    pub id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub condition: WeatherCondition,
    pub location: String,
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewWeatherSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub condition: WeatherCondition,
    pub location: String,
}

impl NewWeatherSnapshot {
    pub fn validate(&self) -> Result<()> {
        check_finite("temperature", self.temperature)?;
        check_percent("humidity", self.humidity)?;
        if !(self.wind_speed.is_finite() && self.wind_speed >= 0.0) {
            return Err(SyncError::invalid(format!(
                "wind_speed must be zero or more, got {}",
                self.wind_speed
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ForecastDay {
    pub id: String,
    pub day: String,
    pub temperature: f64,
    pub condition: WeatherCondition,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewForecastDay {
    pub day: String,
    pub temperature: f64,
    pub condition: WeatherCondition,
}

impl NewForecastDay {
    pub fn validate(&self) -> Result<()> {
        if self.day.trim().is_empty() {
            return Err(SyncError::invalid("forecast day must not be empty"));
        }
        check_finite("temperature", self.temperature)
    }
}

// --- technician view ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub id: String,
    pub name: String,
    pub status: String,
    pub last_checked: DateTime<Utc>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub uptime: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiagnosticResult {
    pub id: String,
    pub component: String,
    pub status: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MaintenanceTask {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, deserialize_with = "date_or_timestamp")]
    pub due_date: Option<NaiveDate>,
    pub priority: String,
    pub status: String,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

// --- per-field history (read through the query client only) ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SoilReading {
    pub id: String,
    #[serde(default)]
    pub field_id: Option<String>,
    #[serde(rename = "type")]
    pub soil_type: String,
    pub moisture: f64,
    pub ph: f64,
    #[serde(default)]
    pub nitrogen: Option<f64>,
    #[serde(default)]
    pub phosphorus: Option<f64>,
    #[serde(default)]
    pub potassium: Option<f64>,
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CropHistoryEntry {
    pub id: String,
    #[serde(default)]
    pub field_id: Option<String>,
    pub crop: String,
    pub year: String,
    #[serde(rename = "yield")]
    pub crop_yield: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Explicit `null` reads as the type's default, same as a missing column.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Date columns hold either `YYYY-MM-DD` or a full RFC 3339 timestamp,
/// depending on who wrote the row. Timestamps keep their UTC date.
fn date_or_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Some(date));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| Some(ts.with_timezone(&Utc).date_naive()))
        .map_err(|e| serde::de::Error::custom(format!("'{}' is neither a date nor a timestamp: {}", raw, e)))
}
