//! Fixed schema: the named collections and the column defaults the store
//! fills in on insert.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "users")]
    Users,
    #[serde(rename = "fields")]
    Fields,
    #[serde(rename = "tasks")]
    Tasks,
    #[serde(rename = "notifications")]
    Notifications,
    #[serde(rename = "weather_data")]
    Weather,
    #[serde(rename = "weather_forecast")]
    Forecast,
    #[serde(rename = "system_status")]
    SystemStatus,
    #[serde(rename = "diagnostic_results")]
    DiagnosticResults,
    #[serde(rename = "maintenance_tasks")]
    MaintenanceTasks,
    #[serde(rename = "soil_data")]
    SoilData,
    #[serde(rename = "crop_history")]
    CropHistory,
}

impl Collection {
    pub const ALL: [Collection; 11] = [
        Collection::Users,
        Collection::Fields,
        Collection::Tasks,
        Collection::Notifications,
        Collection::Weather,
        Collection::Forecast,
        Collection::SystemStatus,
        Collection::DiagnosticResults,
        Collection::MaintenanceTasks,
        Collection::SoilData,
        Collection::CropHistory,
    ];

    /// The nine collections held by the dashboard aggregate.
    pub const AGGREGATE: [Collection; 9] = [
        Collection::Users,
        Collection::Fields,
        Collection::Tasks,
        Collection::Notifications,
        Collection::Weather,
        Collection::Forecast,
        Collection::SystemStatus,
        Collection::DiagnosticResults,
        Collection::MaintenanceTasks,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Fields => "fields",
            Collection::Tasks => "tasks",
            Collection::Notifications => "notifications",
            Collection::Weather => "weather_data",
            Collection::Forecast => "weather_forecast",
            Collection::SystemStatus => "system_status",
            Collection::DiagnosticResults => "diagnostic_results",
            Collection::MaintenanceTasks => "maintenance_tasks",
            Collection::SoilData => "soil_data",
            Collection::CropHistory => "crop_history",
        }
    }

    /// Timestamp columns that get `now()` when an insert leaves them out.
    pub fn timestamp_columns(self) -> &'static [&'static str] {
        match self {
            Collection::Users => &["date_added"],
            Collection::Fields | Collection::Tasks | Collection::MaintenanceTasks => {
                &["created_at", "updated_at"]
            }
            Collection::Notifications => &["time"],
            Collection::Weather | Collection::SoilData => &["recorded_at"],
            Collection::Forecast | Collection::CropHistory => &["created_at"],
            Collection::SystemStatus => &["last_checked", "updated_at"],
            Collection::DiagnosticResults => &["timestamp"],
        }
    }

    pub fn has_updated_at(self) -> bool {
        self.timestamp_columns().contains(&"updated_at")
    }

    /// Fill column defaults on a row about to be inserted. Columns already
    /// present (including explicit nulls) are left alone.
    pub fn apply_defaults(self, row: &mut Map<String, Value>, now: &str) {
        for column in self.timestamp_columns() {
            row.entry(column.to_string())
                .or_insert_with(|| Value::String(now.to_string()));
        }
        match self {
            Collection::Notifications => {
                row.entry("read".to_string()).or_insert(Value::Bool(false));
            }
            Collection::Users => {
                row.entry("permissions".to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
            }
            _ => {}
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .iter()
            .copied()
            .find(|c| c.table() == s)
            .ok_or_else(|| SyncError::UnknownCollection(s.to_string()))
    }
}
