//! Model records: the declared unit of inference capacity.
//!
//! The lifecycle manager is the sole mutator of `state` and the runtime
//! fields; everything else treats records as read-only.

use chrono::{DateTime, Utc};
use runtime::engines::{EngineKind, EngineParams, ModelTask};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Stopped,
    Starting,
    Loading,
    Running,
    Failed,
    Archived,
}

impl ModelState {
    /// States in which the model owns a container.
    pub fn is_live(self) -> bool {
        matches!(self, ModelState::Starting | ModelState::Loading | ModelState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelState::Stopped => "stopped",
            ModelState::Starting => "starting",
            ModelState::Loading => "loading",
            ModelState::Running => "running",
            ModelState::Failed => "failed",
            ModelState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(ModelState::Stopped),
            "starting" => Some(ModelState::Starting),
            "loading" => Some(ModelState::Loading),
            "running" => Some(ModelState::Running),
            "failed" => Some(ModelState::Failed),
            "archived" => Some(ModelState::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRecord {
    pub id: i64,
    pub display_name: String,
    pub served_name: String,
    pub engine: EngineKind,
    pub task: ModelTask,
    pub repo_id: Option<String>,
    pub local_path: Option<String>,
    pub params: EngineParams,
    pub state: ModelState,
    pub host_port: Option<u16>,
    pub container_name: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelRecord {
    /// Deterministic container name owned by this record.
    pub fn expected_container_name(&self) -> String {
        container_name_for(self.id)
    }
}

/// Container naming pattern shared with the orphan sweep.
pub const CONTAINER_NAME_PREFIX: &str = "cortex-model-";

pub fn container_name_for(model_id: i64) -> String {
    format!("{CONTAINER_NAME_PREFIX}{model_id}")
}

/// Fields an operator declares when creating a model.
#[derive(Debug, Clone, Deserialize)]
pub struct NewModel {
    pub display_name: String,
    pub served_name: String,
    pub task: ModelTask,
    pub repo_id: Option<String>,
    pub local_path: Option<String>,
    pub params: EngineParams,
}

/// Sparse update applied by the admin PATCH route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPatch {
    pub display_name: Option<String>,
    pub repo_id: Option<String>,
    pub local_path: Option<String>,
    pub params: Option<EngineParams>,
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ModelRecord, StoreError> {
    let engine_str: String = row.try_get("engine")?;
    let task_str: String = row.try_get("task")?;
    let state_str: String = row.try_get("state")?;
    let params_json: String = row.try_get("params")?;

    let engine: EngineKind = serde_json::from_value(serde_json::Value::String(engine_str.clone()))
        .map_err(|_| StoreError::Corrupt(format!("unknown engine kind: {engine_str}")))?;
    let task: ModelTask = serde_json::from_value(serde_json::Value::String(task_str.clone()))
        .map_err(|_| StoreError::Corrupt(format!("unknown task: {task_str}")))?;
    let state = ModelState::parse(&state_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown model state: {state_str}")))?;
    let params: EngineParams = serde_json::from_str(&params_json)
        .map_err(|e| StoreError::Corrupt(format!("bad engine params: {e}")))?;

    Ok(ModelRecord {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        served_name: row.try_get("served_name")?,
        engine,
        task,
        repo_id: row.try_get("repo_id")?,
        local_path: row.try_get("local_path")?,
        params,
        state,
        host_port: row.try_get::<Option<i64>, _>("host_port")?.map(|p| p as u16),
        container_name: row.try_get("container_name")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn engine_tag(kind: EngineKind) -> &'static str {
    match kind {
        EngineKind::TransformerEngine => "transformer-engine",
        EngineKind::QuantizedEngine => "quantized-engine",
    }
}

fn task_tag(task: ModelTask) -> &'static str {
    match task {
        ModelTask::Generate => "generate",
        ModelTask::Embed => "embed",
    }
}

impl Store {
    /// Insert a declared model. Pools are permitted: several records may
    /// share a served name, but they must agree on the task.
    pub async fn insert_model(&self, new: &NewModel) -> Result<ModelRecord, StoreError> {
        let engine = new.params.kind();

        let clash = sqlx::query(
            "SELECT task FROM models WHERE served_name = ?1 AND state != 'archived' LIMIT 1",
        )
        .bind(&new.served_name)
        .fetch_optional(self.pool())
        .await?;
        if let Some(row) = clash {
            let existing_task: String = row.try_get("task")?;
            if existing_task != task_tag(new.task) {
                return Err(StoreError::Conflict(format!(
                    "served name '{}' already serves task '{}'",
                    new.served_name, existing_task
                )));
            }
        }

        let params_json = serde_json::to_string(&new.params)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO models \
             (display_name, served_name, engine, task, repo_id, local_path, params, state, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'stopped', ?8, ?8)",
        )
        .bind(&new.display_name)
        .bind(&new.served_name)
        .bind(engine_tag(engine))
        .bind(task_tag(new.task))
        .bind(&new.repo_id)
        .bind(&new.local_path)
        .bind(&params_json)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_model(result.last_insert_rowid()).await
    }

    pub async fn get_model(&self, id: i64) -> Result<ModelRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM models WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(StoreError::NotFound)?;
        record_from_row(&row)
    }

    /// List models; archived records are hidden unless asked for.
    pub async fn list_models(&self, include_archived: bool) -> Result<Vec<ModelRecord>, StoreError> {
        let rows = if include_archived {
            sqlx::query("SELECT * FROM models ORDER BY id")
                .fetch_all(self.pool())
                .await?
        } else {
            sqlx::query("SELECT * FROM models WHERE state != 'archived' ORDER BY id")
                .fetch_all(self.pool())
                .await?
        };
        rows.iter().map(record_from_row).collect()
    }

    /// Models currently owning (or expected to own) a container.
    pub async fn live_models(&self) -> Result<Vec<ModelRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM models WHERE state IN ('starting', 'loading', 'running') ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn patch_model(&self, id: i64, patch: &ModelPatch) -> Result<ModelRecord, StoreError> {
        let mut record = self.get_model(id).await?;

        if let Some(name) = &patch.display_name {
            record.display_name = name.clone();
        }
        if let Some(repo) = &patch.repo_id {
            record.repo_id = Some(repo.clone());
        }
        if let Some(path) = &patch.local_path {
            record.local_path = Some(path.clone());
        }
        if let Some(params) = &patch.params {
            record.params = params.clone();
        }

        let params_json = serde_json::to_string(&record.params)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            "UPDATE models SET display_name = ?2, repo_id = ?3, local_path = ?4, params = ?5, \
             engine = ?6, updated_at = ?7 WHERE id = ?1",
        )
        .bind(id)
        .bind(&record.display_name)
        .bind(&record.repo_id)
        .bind(&record.local_path)
        .bind(&params_json)
        .bind(engine_tag(record.params.kind()))
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.get_model(id).await
    }

    pub async fn set_model_state(
        &self,
        id: i64,
        state: ModelState,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let affected = sqlx::query(
            "UPDATE models SET state = ?2, failure_reason = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(id)
        .bind(state.as_str())
        .bind(failure_reason)
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn set_model_runtime(
        &self,
        id: i64,
        host_port: u16,
        container_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE models SET host_port = ?2, container_name = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(id)
        .bind(host_port as i64)
        .bind(container_name)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn clear_model_runtime(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE models SET host_port = NULL, container_name = NULL, updated_at = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Remove the record. Weight files on disk are never touched.
    pub async fn delete_model(&self, id: i64) -> Result<(), StoreError> {
        let affected = sqlx::query("DELETE FROM models WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
