//! Warehouse SQL execution
//!
//! The pipeline only ever sends rendered SQL text. [`SnowCli`] runs it
//! through the `snow` CLI; [`MemoryWarehouse`] records it for tests.

use std::sync::Mutex;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::debug;

/// One result row, column name to value
pub type Row = Map<String, Value>;

/// Failure running a warehouse statement
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WarehouseError {
    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("statement failed: {message}")]
    Statement { message: String },

    #[error("unexpected output: {message}")]
    Output { message: String },
}

impl WarehouseError {
    pub fn statement(message: impl Into<String>) -> Self {
        WarehouseError::Statement {
            message: message.into(),
        }
    }
}

/// Executes SQL against the warehouse
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run one or more `;`-separated statements, returning the rows of the
    /// last one.
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, WarehouseError>;
}

/// Warehouse reached through `snow sql`
#[derive(Clone, Debug, Default)]
pub struct SnowCli {
    connection: Option<String>,
}

impl SnowCli {
    /// `connection` names a `snow` connection; `None` uses its default.
    pub fn new(connection: Option<String>) -> Self {
        Self { connection }
    }

    pub fn args(&self, sql: &str) -> Vec<String> {
        let mut args = vec![
            "sql".to_string(),
            "-q".to_string(),
            sql.to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        if let Some(conn) = &self.connection {
            args.push("-c".to_string());
            args.push(conn.clone());
        }
        args
    }
}

/// Rows of the last statement in `snow sql --format json` output
pub fn parse_rows(stdout: &str) -> Result<Vec<Row>, WarehouseError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(stdout).map_err(|e| WarehouseError::Output {
        message: e.to_string(),
    })?;

    // Multiple statements come back as a list of result sets
    let last = match value {
        Value::Array(items) if items.iter().all(Value::is_array) => {
            items.into_iter().last().unwrap_or(Value::Array(Vec::new()))
        }
        other => other,
    };

    match last {
        Value::Array(rows) => rows
            .into_iter()
            .map(|row| match row {
                Value::Object(map) => Ok(map),
                other => Err(WarehouseError::Output {
                    message: format!("expected a row object, got {}", other),
                }),
            })
            .collect(),
        other => Err(WarehouseError::Output {
            message: format!("expected a list of rows, got {}", other),
        }),
    }
}

/// A configured `snow` connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnowConnection {
    pub name: String,
    pub account: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
    pub is_default: bool,
}

/// Connections in `snow connection list --format json` output
pub fn parse_connections(stdout: &str) -> Result<Vec<SnowConnection>, WarehouseError> {
    let value: Value = serde_json::from_str(stdout).map_err(|e| WarehouseError::Output {
        message: e.to_string(),
    })?;
    let Value::Array(items) = value else {
        return Err(WarehouseError::Output {
            message: "expected a list of connections".to_string(),
        });
    };

    let text = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);
    items
        .iter()
        .map(|item| {
            let name = text(item.get("connection_name")).ok_or_else(|| WarehouseError::Output {
                message: format!("connection without a name: {}", item),
            })?;
            let params = item.get("parameters");
            Ok(SnowConnection {
                name,
                account: text(params.and_then(|p| p.get("account"))),
                user: text(params.and_then(|p| p.get("user"))),
                host: text(params.and_then(|p| p.get("host"))),
                is_default: item
                    .get("is_default")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect()
}

/// Pick the connection to use: the named one, else the default, else the
/// only one configured.
pub fn select_connection(
    connections: &[SnowConnection],
    name: Option<&str>,
) -> Result<SnowConnection, WarehouseError> {
    let found = match name {
        Some(name) => connections.iter().find(|c| c.name == name),
        None => connections
            .iter()
            .find(|c| c.is_default)
            .or(match connections {
                [only] => Some(only),
                _ => None,
            }),
    };
    match found {
        Some(conn) => Ok(conn.clone()),
        None => {
            let names: Vec<&str> = connections.iter().map(|c| c.name.as_str()).collect();
            let wanted = name
                .map(|n| format!("'{}'", n))
                .unwrap_or_else(|| "a default".to_string());
            Err(WarehouseError::Output {
                message: format!(
                    "no {} snow connection among [{}]; set SNOWFLAKE_DEFAULT_CONNECTION_NAME",
                    wanted,
                    names.join(", ")
                ),
            })
        }
    }
}

impl SnowCli {
    /// Configured connections, as reported by `snow connection list`.
    pub async fn connections(&self) -> Result<Vec<SnowConnection>, WarehouseError> {
        let output = Command::new("snow")
            .args(["connection", "list", "--format", "json"])
            .output()
            .await
            .map_err(|e| WarehouseError::Spawn {
                program: "snow".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(WarehouseError::statement(
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        parse_connections(&String::from_utf8_lossy(&output.stdout))
    }

    /// The connection this client runs statements through.
    pub async fn discover(&self) -> Result<SnowConnection, WarehouseError> {
        let connections = self.connections().await?;
        let selected = select_connection(&connections, self.connection.as_deref())?;
        debug!(connection = %selected.name, "discovered snow connection");
        Ok(selected)
    }
}

#[async_trait]
impl Warehouse for SnowCli {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        debug!(statement = %sql.trim(), "executing warehouse sql");
        let output = Command::new("snow")
            .args(self.args(sql))
            .output()
            .await
            .map_err(|e| WarehouseError::Spawn {
                program: "snow".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(WarehouseError::statement(message.trim()));
        }
        parse_rows(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Records statements; fails any statement containing a scripted fragment
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    statements: Mutex<Vec<String>>,
    fail_on: Mutex<Vec<String>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement that contains `fragment`
    pub fn fail_on(&self, fragment: impl Into<String>) {
        if let Ok(mut f) = self.fail_on.lock() {
            f.push(fragment.into());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut f) = self.fail_on.lock() {
            f.clear();
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Recorded statements containing `fragment`
    pub fn matching(&self, fragment: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        if let Ok(mut s) = self.statements.lock() {
            s.push(sql.to_string());
        }
        let failing = self
            .fail_on
            .lock()
            .map(|f| f.iter().any(|frag| sql.contains(frag.as_str())))
            .unwrap_or(false);
        if failing {
            return Err(WarehouseError::statement(format!(
                "scripted failure: {}",
                sql.lines().next().unwrap_or_default()
            )));
        }
        Ok(Vec::new())
    }
}
