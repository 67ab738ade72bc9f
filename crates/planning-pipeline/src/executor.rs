//! Executes atomic units with real file and command operations.
//!
//! - File operations (create, modify, delete) with timestamped backups
//! - Shell command execution with kill-on-deadline
//! - Test execution via a configurable test command
//! - Sandbox confinement to the working directory
//! - Dry-run mode that simulates without touching disk

use crate::decomposer::AtomicUnit;
use crate::PipelineError;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    FileCreate,
    FileModify,
    FileDelete,
    Command,
    Test,
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub unit_id: String,
    pub status: ExecutionStatus,
    pub execution_type: ExecutionType,
    pub output: String,
    pub error: Option<String>,
    pub files_created: Vec<String>,
    pub files_changed: Vec<String>,
    pub files_deleted: Vec<String>,
    pub commands_run: Vec<CommandResult>,
    pub duration_ms: i64,
    pub metadata: Value,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    fn failed(unit_id: &str, execution_type: ExecutionType, error: String) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            status: ExecutionStatus::Failed,
            execution_type,
            output: String::new(),
            error: Some(error),
            files_created: Vec::new(),
            files_changed: Vec::new(),
            files_deleted: Vec::new(),
            commands_run: Vec::new(),
            duration_ms: 0,
            metadata: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone)]
struct FileOperation {
    path: PathBuf,
    backup_path: PathBuf,
}

pub struct UnitExecutor {
    working_dir: PathBuf,
    backup_dir: PathBuf,
    sandbox: bool,
    dry_run: bool,
    default_timeout: Duration,
    file_operations: Mutex<Vec<FileOperation>>,
    execution_count: AtomicU64,
    success_count: AtomicU64,
}

impl UnitExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let working_dir = working_dir.into();
        let backup_dir = working_dir.join(".backups");
        Self {
            working_dir,
            backup_dir,
            sandbox: false,
            dry_run: false,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
            file_operations: Mutex::new(Vec::new()),
            execution_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
        }
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_backup_dir(mut self, backup_dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = backup_dir.into();
        self
    }

    /// Execute one unit. Errors are captured in the result, never raised.
    pub async fn execute(
        &self,
        unit: &AtomicUnit,
        context: &HashMap<String, Value>,
    ) -> ExecutionResult {
        let started = Instant::now();
        self.execution_count.fetch_add(1, Ordering::Relaxed);

        info!(unit_id = %unit.id, title = %unit.title, "Executing unit");

        let execution_type = Self::determine_execution_type(unit);

        let mut result = if self.dry_run {
            self.execute_dry_run(unit, execution_type)
        } else {
            match self.execute_real(unit, execution_type, context).await {
                Ok(result) => result,
                Err(e) => {
                    error!(unit_id = %unit.id, "Unit execution failed: {}", e);
                    ExecutionResult::failed(&unit.id, execution_type, e.to_string())
                }
            }
        };

        if result.status == ExecutionStatus::Success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        }
        result.duration_ms = started.elapsed().as_millis() as i64;

        info!(unit_id = %unit.id, status = ?result.status, "Unit execution complete");
        result
    }

    fn determine_execution_type(unit: &AtomicUnit) -> ExecutionType {
        let description = unit.description.to_lowercase();

        if !unit.files.is_empty() {
            if unit.files.iter().any(|f| f.to_lowercase().contains("test")) {
                return ExecutionType::Test;
            }
            if description.contains("modify") || description.contains("update") {
                return ExecutionType::FileModify;
            }
            if description.contains("delete") || description.contains("remove") {
                return ExecutionType::FileDelete;
            }
            return ExecutionType::FileCreate;
        }

        if description.contains("test") {
            ExecutionType::Test
        } else if description.contains("create") || description.contains("add") {
            ExecutionType::FileCreate
        } else if description.contains("modify") || description.contains("update") {
            ExecutionType::FileModify
        } else if description.contains("delete") || description.contains("remove") {
            ExecutionType::FileDelete
        } else if description.contains("run") || description.contains("execute") {
            ExecutionType::Command
        } else {
            ExecutionType::Composite
        }
    }

    fn execute_dry_run(&self, unit: &AtomicUnit, execution_type: ExecutionType) -> ExecutionResult {
        info!(unit_id = %unit.id, ?execution_type, "DRY RUN");
        ExecutionResult {
            unit_id: unit.id.clone(),
            status: ExecutionStatus::Success,
            execution_type,
            output: format!("DRY RUN: {}", unit.title),
            error: None,
            files_created: Vec::new(),
            files_changed: unit.files.clone(),
            files_deleted: Vec::new(),
            commands_run: Vec::new(),
            duration_ms: 0,
            metadata: serde_json::json!({"dry_run": true}),
        }
    }

    async fn execute_real(
        &self,
        unit: &AtomicUnit,
        execution_type: ExecutionType,
        context: &HashMap<String, Value>,
    ) -> Result<ExecutionResult, PipelineError> {
        let mut files_created = Vec::new();
        let mut files_changed = Vec::new();
        let mut files_deleted = Vec::new();
        let mut commands_run = Vec::new();
        let mut output_parts = Vec::new();

        let content = context
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        for file in &unit.files {
            let full_path = self.resolve_path(file);

            // The sandbox check happens before any I/O on the path.
            if self.sandbox && !self.is_safe_path(&full_path) {
                return Ok(ExecutionResult::failed(
                    &unit.id,
                    execution_type,
                    format!("Path outside sandbox: {}", file),
                ));
            }

            match execution_type {
                ExecutionType::FileCreate | ExecutionType::Test => {
                    if !full_path.exists() {
                        self.create_file(&full_path, &content)?;
                        files_created.push(full_path.display().to_string());
                        output_parts.push(format!("Created: {}", file));
                    } else {
                        output_parts.push(format!("Exists: {}", file));
                    }
                }
                ExecutionType::FileModify => {
                    if full_path.exists() {
                        self.backup_file(&full_path)?;
                        std::fs::write(&full_path, &content)?;
                        files_changed.push(full_path.display().to_string());
                        output_parts.push(format!("Modified: {}", file));
                    }
                }
                ExecutionType::FileDelete => {
                    if full_path.exists() {
                        self.backup_file(&full_path)?;
                        std::fs::remove_file(&full_path)?;
                        files_deleted.push(full_path.display().to_string());
                        output_parts.push(format!("Deleted: {}", file));
                    }
                }
                _ => {}
            }
        }

        if execution_type == ExecutionType::Test {
            let test_command = context
                .get("test_command")
                .and_then(|v| v.as_str())
                .unwrap_or("pytest");
            let command = if unit.files.is_empty() {
                test_command.to_string()
            } else {
                format!("{} {}", test_command, unit.files.join(" "))
            };

            let command_result = self.run_command(&command, self.default_timeout).await;
            let passed = command_result.return_code == 0;
            output_parts.push(format!(
                "Tests: {}",
                if passed { "PASSED" } else { "FAILED" }
            ));
            let stderr = command_result.stderr.clone();
            commands_run.push(command_result);

            if !passed {
                return Ok(ExecutionResult {
                    unit_id: unit.id.clone(),
                    status: ExecutionStatus::Failed,
                    execution_type,
                    output: output_parts.join("\n"),
                    error: Some(if stderr.is_empty() {
                        "Tests failed".to_string()
                    } else {
                        stderr
                    }),
                    files_created,
                    files_changed,
                    files_deleted,
                    commands_run,
                    duration_ms: 0,
                    metadata: Value::Object(Default::default()),
                });
            }
        }

        // Commands attached to acceptance criteria run under their own
        // timeouts; the manual sentinel is not executed here.
        for criterion in &unit.acceptance_criteria {
            if criterion.is_manual() {
                continue;
            }
            let timeout = Duration::from_secs(criterion.timeout_seconds.max(1));
            let command_result = self.run_command(&criterion.validation_command, timeout).await;
            commands_run.push(command_result);
        }

        Ok(ExecutionResult {
            unit_id: unit.id.clone(),
            status: ExecutionStatus::Success,
            execution_type,
            output: if output_parts.is_empty() {
                "Execution complete".to_string()
            } else {
                output_parts.join("\n")
            },
            error: None,
            files_created,
            files_changed,
            files_deleted,
            commands_run,
            duration_ms: 0,
            metadata: Value::Object(Default::default()),
        })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_dir.join(p)
        }
    }

    /// A path is safe when its normal form stays under the working dir.
    fn is_safe_path(&self, path: &Path) -> bool {
        let root = match self.working_dir.canonicalize() {
            Ok(root) => root,
            Err(_) => return false,
        };
        // The target may not exist yet; canonicalize the nearest existing
        // ancestor and re-append the remainder.
        let mut existing = path.to_path_buf();
        let mut remainder = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    remainder.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => return false,
            }
        }
        let Ok(mut resolved) = existing.canonicalize() else {
            return false;
        };
        for part in remainder.iter().rev() {
            resolved.push(part);
        }
        resolved.starts_with(&root)
    }

    fn create_file(&self, path: &Path, content: &str) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        debug!(path = %path.display(), "Created file");
        Ok(())
    }

    fn backup_file(&self, path: &Path) -> Result<(), PipelineError> {
        if !path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.backup_dir)?;

        let timestamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let backup_path = self.backup_dir.join(format!("{}.{}.bak", name, timestamp));

        std::fs::copy(path, &backup_path)?;
        self.file_operations.lock().push(FileOperation {
            path: path.to_path_buf(),
            backup_path: backup_path.clone(),
        });
        debug!(path = %path.display(), backup = %backup_path.display(), "Backed up file");
        Ok(())
    }

    /// Run a shell command in the working directory with a wall-clock
    /// deadline. On timeout the process is killed and the result carries
    /// `timed_out = true`; every field is populated on any exit.
    pub async fn run_command(&self, command: &str, timeout: Duration) -> CommandResult {
        let started = Instant::now();
        debug!(command, "Running command");

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return CommandResult {
                    command: command.to_string(),
                    return_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration_ms: started.elapsed().as_millis() as i64,
                    timed_out: false,
                }
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandResult {
                command: command.to_string(),
                return_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration_ms: started.elapsed().as_millis() as i64,
                timed_out: false,
            },
            Ok(Err(e)) => CommandResult {
                command: command.to_string(),
                return_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
                duration_ms: started.elapsed().as_millis() as i64,
                timed_out: false,
            },
            Err(_) => CommandResult {
                command: command.to_string(),
                return_code: -1,
                stdout: String::new(),
                stderr: format!("Command timed out after {:?}", timeout),
                duration_ms: started.elapsed().as_millis() as i64,
                timed_out: true,
            },
        }
    }

    /// Replace `path` with its most recent backup. Returns false when no
    /// backup is recorded.
    pub fn restore_from_backup(&self, path: &str) -> bool {
        let target = self.resolve_path(path);
        let operations = self.file_operations.lock();
        for op in operations.iter().rev() {
            if op.path == target && op.backup_path.exists() {
                if std::fs::copy(&op.backup_path, &op.path).is_ok() {
                    info!(path = %op.path.display(), "Restored file from backup");
                    return true;
                }
            }
        }
        false
    }

    /// Remove all backups; repeat calls are no-ops.
    pub fn clear_backups(&self) {
        if self.backup_dir.exists() {
            let _ = std::fs::remove_dir_all(&self.backup_dir);
        }
        self.file_operations.lock().clear();
        info!("Cleared all backups");
    }

    pub fn get_statistics(&self) -> Value {
        let executions = self.execution_count.load(Ordering::Relaxed);
        let successes = self.success_count.load(Ordering::Relaxed);
        serde_json::json!({
            "execution_count": executions,
            "success_count": successes,
            "success_rate": if executions > 0 {
                successes as f64 / executions as f64
            } else {
                0.0
            },
            "file_operations": self.file_operations.lock().len(),
            "working_dir": self.working_dir.display().to_string(),
            "sandbox": self.sandbox,
            "dry_run": self.dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposer::{Complexity, Criterion};

    fn unit(id: &str, files: &[&str], description: &str) -> AtomicUnit {
        AtomicUnit {
            id: id.to_string(),
            title: format!("Unit {}", id),
            description: description.to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            dependencies: vec![],
            acceptance_criteria: vec![],
            phase: None,
            complexity: Complexity::Low,
            estimated_minutes: 10,
            compensation_action: "git checkout -- .".to_string(),
        }
    }

    #[tokio::test]
    async fn test_file_create_writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UnitExecutor::new(dir.path());

        let mut context = HashMap::new();
        context.insert("content".to_string(), serde_json::json!("hello"));

        let result = executor.execute(&unit("u1", &["out.txt"], ""), &context).await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.files_created.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn test_existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "original").unwrap();
        let executor = UnitExecutor::new(dir.path());

        let mut context = HashMap::new();
        context.insert("content".to_string(), serde_json::json!("clobber"));

        let result = executor.execute(&unit("u1", &["out.txt"], ""), &context).await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(result.output.contains("Exists: out.txt"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "original"
        );
    }

    #[tokio::test]
    async fn test_sandbox_violation_fails_without_io() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UnitExecutor::new(dir.path()).with_sandbox(true);

        let result = executor
            .execute(&unit("u1", &["/etc/passwd"], ""), &HashMap::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("outside sandbox"));
        assert!(result.files_created.is_empty());
        assert!(result.files_changed.is_empty());
    }

    #[tokio::test]
    async fn test_sandbox_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("inner");
        std::fs::create_dir(&nested).unwrap();
        let executor = UnitExecutor::new(&nested).with_sandbox(true);

        let result = executor
            .execute(&unit("u1", &["../escape.txt"], ""), &HashMap::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_modify_backs_up_then_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "A").unwrap();
        let executor = UnitExecutor::new(dir.path());

        let mut context = HashMap::new();
        context.insert("content".to_string(), serde_json::json!("B"));

        let result = executor
            .execute(&unit("u1", &["f.txt"], "modify the config file"), &context)
            .await;
        assert_eq!(result.execution_type, ExecutionType::FileModify);
        assert_eq!(result.files_changed.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "B"
        );

        // The backup holds the pre-modification content.
        let backups: Vec<_> = std::fs::read_dir(dir.path().join(".backups"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read_to_string(&backups[0]).unwrap(), "A");

        assert!(executor.restore_from_backup("f.txt"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "A"
        );
    }

    #[tokio::test]
    async fn test_command_timeout_kills_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UnitExecutor::new(dir.path());

        let result = executor
            .run_command("sleep 5", Duration::from_millis(100))
            .await;
        assert!(result.timed_out);
        assert_eq!(result.return_code, -1);
        assert!(result.duration_ms < 3000);
    }

    #[tokio::test]
    async fn test_criterion_commands_are_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "x").unwrap();
        let executor = UnitExecutor::new(dir.path());

        let mut u = unit("u1", &[], "wire things together somehow");
        u.acceptance_criteria = vec![
            Criterion {
                id: "c1".to_string(),
                description: "file present".to_string(),
                validation_command: "test -f present.txt".to_string(),
                expected_result: "success".to_string(),
                timeout_seconds: 10,
            },
            Criterion {
                id: "c2".to_string(),
                description: "manual".to_string(),
                validation_command: "echo 'Manual verification required'".to_string(),
                expected_result: "success".to_string(),
                timeout_seconds: 10,
            },
        ];

        let result = executor.execute(&u, &HashMap::new()).await;
        assert_eq!(result.status, ExecutionStatus::Success);
        // The manual sentinel is skipped.
        assert_eq!(result.commands_run.len(), 1);
        assert_eq!(result.commands_run[0].return_code, 0);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UnitExecutor::new(dir.path()).with_dry_run(true);

        let result = executor
            .execute(&unit("u1", &["ghost.txt"], ""), &HashMap::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.metadata["dry_run"], serde_json::json!(true));
        assert!(!dir.path().join("ghost.txt").exists());
    }

    #[tokio::test]
    async fn test_failing_test_command_fails_unit() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UnitExecutor::new(dir.path());

        let mut context = HashMap::new();
        context.insert("test_command".to_string(), serde_json::json!("false"));

        let result = executor
            .execute(&unit("u1", &["test_thing.txt"], ""), &context)
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.output.contains("Tests: FAILED"));
    }

    #[tokio::test]
    async fn test_clear_backups_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let executor = UnitExecutor::new(dir.path());
        executor.clear_backups();
        executor.clear_backups();
        assert!(!executor.restore_from_backup("anything.txt"));
    }
}
