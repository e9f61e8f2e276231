//! Age and pattern based retention of files under monitored paths
//!
//! Analysis walks a directory tree and proposes one [`CleanupRecommendation`]
//! per matching file without touching anything. Execution acts on a batch of
//! recommendations; a failure on one file is recorded in the result and the
//! rest of the batch continues.
//!
//! Rule patterns are globs. A pattern without `/` matches the file name, a
//! pattern with `/` matches the path relative to the analyzed root:
//!
//! ```text
//! *.log              any .log file at any depth
//! exports/*.csv      csv files directly below exports/
//! cache/**           everything below cache/
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use glob::{MatchOptions, Pattern, PatternError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::RetentionConfig;
use crate::error::{ScalingError, ScalingResult};

use super::backend::StorageBackend;
use super::schema::{CleanupRecord, CleanupTrigger};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    Delete,
    /// Copy into the archive, verify the checksum, then remove the original
    Archive,
    /// Gzip in place (`name` becomes `name.gz`)
    Compress,
    /// Relocate into the rule's destination
    Move,
    /// Protect matching files from lower priority rules
    Keep,
}

impl RetentionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionAction::Delete => "delete",
            RetentionAction::Archive => "archive",
            RetentionAction::Compress => "compress",
            RetentionAction::Move => "move",
            RetentionAction::Keep => "keep",
        }
    }
}

impl fmt::Display for RetentionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub name: String,
    pub file_pattern: String,
    /// A file matches once it is strictly older than this
    pub max_age_days: u32,
    pub action: RetentionAction,
    /// Higher wins when several rules match one file
    #[serde(default)]
    pub priority: u32,
    /// Target directory for `move`; overrides the archive root for `archive`
    #[serde(default)]
    pub destination: Option<PathBuf>,
}

impl RetentionRule {
    pub fn new(
        name: impl Into<String>,
        file_pattern: impl Into<String>,
        max_age_days: u32,
        action: RetentionAction,
    ) -> Self {
        Self {
            name: name.into(),
            file_pattern: file_pattern.into(),
            max_age_days,
            action,
            priority: 0,
            destination: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Named set of rules, optionally scoped to one instance and/or data type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    pub rules: Vec<RetentionRule>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RetentionPolicy {
    pub fn new(name: impl Into<String>, rules: Vec<RetentionRule>) -> Self {
        Self {
            name: name.into(),
            rules,
            instance_name: None,
            data_type: None,
            enabled: true,
        }
    }

    pub fn for_instance(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = Some(instance_name.into());
        self
    }

    pub fn for_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    /// A scoped policy only applies to a matching scope; unscoped ones apply everywhere
    pub fn applies_to(&self, instance_name: Option<&str>, data_type: Option<&str>) -> bool {
        let instance_ok = self
            .instance_name
            .as_deref()
            .is_none_or(|wanted| instance_name == Some(wanted));
        let data_type_ok = self
            .data_type
            .as_deref()
            .is_none_or(|wanted| data_type == Some(wanted));
        self.enabled && instance_ok && data_type_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRecommendation {
    pub path: PathBuf,
    pub policy: String,
    pub rule: String,
    pub action: RetentionAction,
    pub priority: u32,
    pub size_bytes: u64,
    pub estimated_savings: u64,
    pub age_days: f64,
    pub destination: Option<PathBuf>,
    pub safe_to_execute: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupError {
    pub path: PathBuf,
    pub action: RetentionAction,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub files_processed: usize,
    pub files_deleted: usize,
    pub files_archived: usize,
    pub files_compressed: usize,
    pub files_moved: usize,
    /// Recommendations not acted on (unsafe or `keep`)
    pub files_skipped: usize,
    /// Actual bytes for a real run, estimated bytes for a dry run
    pub bytes_freed: u64,
    pub errors: Vec<CleanupError>,
}

impl CleanupResult {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            started_at: Utc::now(),
            completed_at: None,
            files_processed: 0,
            files_deleted: 0,
            files_archived: 0,
            files_compressed: 0,
            files_moved: 0,
            files_skipped: 0,
            bytes_freed: 0,
            errors: Vec::new(),
        }
    }

    fn count(&mut self, action: RetentionAction) {
        match action {
            RetentionAction::Delete => self.files_deleted += 1,
            RetentionAction::Archive => self.files_archived += 1,
            RetentionAction::Compress => self.files_compressed += 1,
            RetentionAction::Move => self.files_moved += 1,
            RetentionAction::Keep => self.files_skipped += 1,
        }
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compile a rule pattern
///
/// `*`, `?` and `[...]` stay within one path segment, `**` crosses segments
/// and a leading `**/` also matches zero directories.
pub fn compile_pattern(pattern: &str) -> Result<Pattern, PatternError> {
    Pattern::new(pattern)
}

/// Match a compiled rule pattern against a `/` separated path
pub fn pattern_matches(pattern: &Pattern, path: &str) -> bool {
    pattern.matches_with(path, MATCH_OPTIONS)
}

#[derive(Debug)]
struct CompiledRule {
    policy: String,
    rule: RetentionRule,
    pattern: Pattern,
    match_name_only: bool,
}

impl CompiledRule {
    fn matches(&self, relative: &str, file_name: &str) -> bool {
        if self.match_name_only {
            pattern_matches(&self.pattern, file_name)
        } else {
            pattern_matches(&self.pattern, relative)
        }
    }
}

/// Rules of all applicable policies, highest priority first
fn compile_rules(policies: &[RetentionPolicy]) -> Vec<CompiledRule> {
    let mut compiled: Vec<CompiledRule> = policies
        .iter()
        .flat_map(|policy| policy.rules.iter().map(move |rule| (policy, rule)))
        .filter_map(|(policy, rule)| match compile_pattern(&rule.file_pattern) {
            Ok(pattern) => Some(CompiledRule {
                policy: policy.name.clone(),
                rule: rule.clone(),
                pattern,
                match_name_only: !rule.file_pattern.contains('/'),
            }),
            Err(e) => {
                warn!(
                    "skipping rule {}/{}: bad pattern {:?}: {e}",
                    policy.name, rule.name, rule.file_pattern
                );
                None
            }
        })
        .collect();

    // stable, so declaration order breaks ties
    compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
    compiled
}

fn age_in_days(modified: SystemTime, now: SystemTime) -> f64 {
    now.duration_since(modified)
        .map(|age| age.as_secs_f64() / SECONDS_PER_DAY)
        .unwrap_or(0.0)
}

struct Analysis<'a> {
    root: &'a Path,
    rules: &'a [CompiledRule],
    archive_dir: Option<PathBuf>,
    compression_ratio: f64,
    now: SystemTime,
}

impl Analysis<'_> {
    fn walk(&self, dir: &Path, out: &mut Vec<CleanupRecommendation>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            // symlinks are neither followed nor acted on
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if self.archive_dir.as_deref() == Some(path.as_path()) {
                    continue;
                }
                if let Err(e) = self.walk(&path, out) {
                    warn!("skipping unreadable directory {}: {e}", path.display());
                }
            } else if file_type.is_file() {
                match entry.metadata() {
                    Ok(metadata) => {
                        if let Some(rec) = self.recommend(&path, &metadata) {
                            out.push(rec);
                        }
                    }
                    Err(e) => warn!("skipping {}: {e}", path.display()),
                }
            }
        }
        Ok(())
    }

    fn recommend(&self, path: &Path, metadata: &fs::Metadata) -> Option<CleanupRecommendation> {
        let relative = path
            .strip_prefix(self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let file_name = path.file_name()?.to_string_lossy();
        let age_days = age_in_days(metadata.modified().ok()?, self.now);

        let matched = self.rules.iter().find(|compiled| {
            compiled.matches(&relative, &file_name) && age_days > compiled.rule.max_age_days as f64
        })?;
        let rule = &matched.rule;

        if rule.action == RetentionAction::Keep {
            trace!("{} kept by rule {}", path.display(), rule.name);
            return None;
        }

        let size_bytes = metadata.len();
        let estimated_savings = match rule.action {
            RetentionAction::Compress => {
                (size_bytes as f64 * (1.0 - self.compression_ratio).clamp(0.0, 1.0)) as u64
            }
            _ => size_bytes,
        };

        let destination = match rule.action {
            RetentionAction::Archive => rule.destination.clone().or(self.archive_dir.clone()),
            RetentionAction::Move => rule.destination.clone(),
            _ => None,
        };

        let (safe_to_execute, reason) = match rule.action {
            RetentionAction::Move | RetentionAction::Archive if destination.is_none() => {
                (false, format!("rule {} has no destination", rule.name))
            }
            RetentionAction::Compress if file_name.ends_with(".gz") => {
                (false, "file is already compressed".to_string())
            }
            _ => (
                true,
                format!(
                    "{} is {:.0} days old, older than {} days",
                    relative, age_days, rule.max_age_days
                ),
            ),
        };

        Some(CleanupRecommendation {
            path: path.to_path_buf(),
            policy: matched.policy.clone(),
            rule: rule.name.clone(),
            action: rule.action,
            priority: rule.priority,
            size_bytes,
            estimated_savings,
            age_days,
            destination,
            safe_to_execute,
            reason,
        })
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// `dir/name`, or `dir/name.N` for the first free N
fn unique_destination(dir: &Path, file_name: &std::ffi::OsStr) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let base = file_name.to_string_lossy();
    (1..)
        .map(|n| dir.join(format!("{base}.{n}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

fn file_name_of(path: &Path) -> io::Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))
}

/// Performs one action, returning the bytes it freed at the original location
fn apply_action(rec: &CleanupRecommendation) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(&rec.path)?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    let size = metadata.len();

    match rec.action {
        RetentionAction::Delete => {
            fs::remove_file(&rec.path)?;
            Ok(size)
        }
        RetentionAction::Archive => {
            let root = rec.destination.as_deref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no archive directory")
            })?;
            let dir = root.join(Utc::now().format("%Y-%m-%d").to_string());
            fs::create_dir_all(&dir)?;
            let target = unique_destination(&dir, file_name_of(&rec.path)?);

            let source_digest = sha256_file(&rec.path)?;
            fs::copy(&rec.path, &target)?;
            let copy_digest = sha256_file(&target)?;
            if source_digest != copy_digest {
                let _ = fs::remove_file(&target);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "archive copy checksum mismatch",
                ));
            }

            let mut sidecar = target.clone().into_os_string();
            sidecar.push(".sha256");
            let archived_name = file_name_of(&target)?.to_string_lossy().to_string();
            fs::write(&sidecar, format!("{source_digest}  {archived_name}\n"))?;

            fs::remove_file(&rec.path)?;
            debug!("archived {} to {}", rec.path.display(), target.display());
            Ok(size)
        }
        RetentionAction::Compress => {
            let mut target = rec.path.clone().into_os_string();
            target.push(".gz");
            let target = PathBuf::from(target);
            if target.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", target.display()),
                ));
            }

            let mut reader = BufReader::new(File::open(&rec.path)?);
            let mut encoder =
                GzEncoder::new(BufWriter::new(File::create(&target)?), Compression::default());
            let written = io::copy(&mut reader, &mut encoder)
                .and_then(|_| encoder.finish())
                .and_then(|mut writer| io::Write::flush(&mut writer));
            if let Err(e) = written {
                let _ = fs::remove_file(&target);
                return Err(e);
            }

            fs::remove_file(&rec.path)?;
            let compressed = fs::metadata(&target)?.len();
            Ok(size.saturating_sub(compressed))
        }
        RetentionAction::Move => {
            let dir = rec.destination.as_deref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no move destination")
            })?;
            fs::create_dir_all(dir)?;
            let target = unique_destination(dir, file_name_of(&rec.path)?);
            if fs::rename(&rec.path, &target).is_err() {
                // across filesystems
                fs::copy(&rec.path, &target)?;
                fs::remove_file(&rec.path)?;
            }
            Ok(size)
        }
        RetentionAction::Keep => Ok(0),
    }
}

/// Evaluates retention policies and executes cleanup batches
pub struct DataRetentionManager {
    config: RetentionConfig,
    policies: RwLock<Vec<RetentionPolicy>>,
    history: Mutex<VecDeque<CleanupResult>>,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl fmt::Debug for DataRetentionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRetentionManager")
            .field("config", &self.config)
            .field("persistent", &self.backend.is_some())
            .finish()
    }
}

impl DataRetentionManager {
    pub fn new(config: RetentionConfig, backend: Option<Arc<dyn StorageBackend>>) -> Self {
        let policies = config.policies.clone();
        Self {
            config,
            policies: RwLock::new(policies),
            history: Mutex::new(VecDeque::new()),
            backend,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Add a policy, replacing one with the same name
    pub async fn add_policy(&self, policy: RetentionPolicy) {
        let mut policies = self.policies.write().await;
        match policies.iter_mut().find(|p| p.name == policy.name) {
            Some(existing) => *existing = policy,
            None => policies.push(policy),
        }
    }

    pub async fn remove_policy(&self, name: &str) -> bool {
        let mut policies = self.policies.write().await;
        let before = policies.len();
        policies.retain(|p| p.name != name);
        policies.len() != before
    }

    pub async fn policies(&self) -> Vec<RetentionPolicy> {
        self.policies.read().await.clone()
    }

    /// Recommendations from the unscoped policies; never modifies the filesystem
    pub async fn analyze_directory(
        &self,
        path: impl AsRef<Path>,
    ) -> ScalingResult<Vec<CleanupRecommendation>> {
        self.analyze_scoped(path, None, None).await
    }

    /// Recommendations from the policies that apply to an instance and data type
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn analyze_scoped(
        &self,
        path: impl AsRef<Path>,
        instance_name: Option<&str>,
        data_type: Option<&str>,
    ) -> ScalingResult<Vec<CleanupRecommendation>> {
        let root = path.as_ref().to_path_buf();
        let applicable: Vec<RetentionPolicy> = self
            .policies
            .read()
            .await
            .iter()
            .filter(|p| p.applies_to(instance_name, data_type))
            .cloned()
            .collect();

        if applicable.is_empty() {
            debug!("no retention policy applies to {}", root.display());
            return Ok(Vec::new());
        }

        let archive_dir = fs::canonicalize(&self.config.archive_dir)
            .unwrap_or_else(|_| self.config.archive_dir.clone());
        let compression_ratio = self.config.compression_ratio_estimate;

        let recommendations = tokio::task::spawn_blocking(move || {
            let rules = compile_rules(&applicable);
            let root = fs::canonicalize(&root)?;
            let analysis = Analysis {
                root: &root,
                rules: &rules,
                archive_dir: Some(archive_dir),
                compression_ratio,
                now: SystemTime::now(),
            };
            let mut out = Vec::new();
            analysis.walk(&root, &mut out)?;
            out.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.path.cmp(&b.path)));
            Ok::<_, io::Error>(out)
        })
        .await
        .map_err(|e| ScalingError::Io(io::Error::other(e.to_string())))??;

        debug!("{} cleanup recommendations", recommendations.len());
        Ok(recommendations)
    }

    /// Execute a batch requested through the API
    pub async fn execute_cleanup(
        &self,
        recommendations: &[CleanupRecommendation],
        dry_run: bool,
    ) -> CleanupResult {
        self.execute_cleanup_with(recommendations, dry_run, CleanupTrigger::Manual)
            .await
    }

    /// Execute safe recommendations, highest priority first
    ///
    /// A dry run only counts what would happen. Per-file failures are logged
    /// and recorded in the result.
    #[instrument(skip(self, recommendations), fields(count = recommendations.len()))]
    pub async fn execute_cleanup_with(
        &self,
        recommendations: &[CleanupRecommendation],
        dry_run: bool,
        trigger: CleanupTrigger,
    ) -> CleanupResult {
        let mut ordered: Vec<&CleanupRecommendation> = recommendations.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut result = CleanupResult::new(dry_run);

        for rec in ordered {
            if !rec.safe_to_execute || rec.action == RetentionAction::Keep {
                result.files_skipped += 1;
                continue;
            }
            result.files_processed += 1;

            if dry_run {
                result.count(rec.action);
                result.bytes_freed += rec.estimated_savings;
                continue;
            }

            let owned = rec.clone();
            let outcome = tokio::task::spawn_blocking(move || apply_action(&owned))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e.to_string())));

            match outcome {
                Ok(freed) => {
                    result.count(rec.action);
                    result.bytes_freed += freed;
                }
                Err(e) => {
                    let err = ScalingError::CleanupAction {
                        path: rec.path.display().to_string(),
                        action: rec.action.to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{err}");
                    result.errors.push(CleanupError {
                        path: rec.path.clone(),
                        action: rec.action,
                        reason: e.to_string(),
                    });
                }
            }
        }

        result.completed_at = Some(Utc::now());
        info!(
            "cleanup {}: {} processed, {} freed, {} errors",
            if dry_run { "dry run" } else { "done" },
            result.files_processed,
            crate::util::format_bytes(result.bytes_freed),
            result.errors.len()
        );

        self.record(&result, trigger).await;
        result
    }

    async fn record(&self, result: &CleanupResult, trigger: CleanupTrigger) {
        {
            let mut history = self.history.lock().await;
            history.push_back(result.clone());
            while history.len() > self.config.cleanup_history_size {
                history.pop_front();
            }
        }

        if let Some(backend) = &self.backend {
            let record = CleanupRecord::from_result(result, trigger);
            if let Err(e) = backend.record_cleanup(record).await {
                warn!("failed to persist cleanup result: {e}");
            }
        }
    }

    /// Results of past batches, oldest first
    pub async fn cleanup_history(&self) -> Vec<CleanupResult> {
        self.history.lock().await.iter().cloned().collect()
    }
}
