//! What a sync run hands back: a status per scope (and direction), counts of
//! what happened, and every entity we had to skip along the way. Partial
//! success is the normal outcome, so none of this is an error.

use crate::error::NError;
use crate::models::{EntityType, Scope};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[serde(rename = "download")]
    Download,
    #[serde(rename = "upload")]
    Upload,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

/// How a scope ended up
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", content = "error")]
pub enum ScopeStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed(String),
    #[serde(rename = "cancelled")]
    Cancelled,
}

/// What happened while syncing a scope
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScopeStats {
    pub chunks: usize,
    pub added: usize,
    pub updated: usize,
    pub conflicts: usize,
    pub expunged: usize,
    pub uploaded: usize,
    pub deferred: usize,
    pub skipped: usize,
    /// Set when the download was forced to start over
    pub full_resync: bool,
    /// Set when an upload saw a USN it didn't expect (somebody else changed
    /// the scope under us)
    pub resync_needed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScopeReport {
    pub scope: Scope,
    pub direction: Direction,
    #[serde(flatten)]
    pub status: ScopeStatus,
    pub stats: ScopeStats,
}

/// An entity we skipped
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncWarning {
    pub scope: Scope,
    pub direction: Direction,
    pub entity_type: EntityType,
    /// guid if it has one, local id otherwise
    pub id: String,
    pub message: String,
}

/// Tracks one scope while a coordinator works on it
#[derive(Debug, Clone)]
pub struct ScopeRun {
    pub scope: Scope,
    pub direction: Direction,
    pub stats: ScopeStats,
    pub warnings: Vec<SyncWarning>,
}

impl ScopeRun {
    pub fn new(scope: &Scope, direction: Direction) -> ScopeRun {
        ScopeRun {
            scope: scope.clone(),
            direction: direction,
            stats: Default::default(),
            warnings: Vec::new(),
        }
    }

    /// Record a skipped entity
    pub fn skip(&mut self, ty: EntityType, id: &str, err: &NError) {
        self.stats.skipped += 1;
        self.warnings.push(SyncWarning {
            scope: self.scope.clone(),
            direction: self.direction,
            entity_type: ty,
            id: String::from(id),
            message: err.to_string(),
        });
    }

    /// Record an entity that's still waiting on something else to sync first
    pub fn defer(&mut self, ty: EntityType, id: &str, waiting_on: &str) {
        self.stats.deferred += 1;
        self.warnings.push(SyncWarning {
            scope: self.scope.clone(),
            direction: self.direction,
            entity_type: ty,
            id: String::from(id),
            message: format!("deferred: waiting on {}", waiting_on),
        });
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub scopes: Vec<ScopeReport>,
    pub warnings: Vec<SyncWarning>,
    /// Whether we ran the download a second time after uploading
    pub resynced: bool,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn new() -> SyncReport {
        Default::default()
    }

    /// File a scope's outcome (and its warnings) into the report
    pub fn add_scope(&mut self, run: ScopeRun, status: ScopeStatus) {
        let ScopeRun { scope, direction, stats, mut warnings } = run;
        self.warnings.append(&mut warnings);
        self.scopes.push(ScopeReport {
            scope: scope,
            direction: direction,
            status: status,
            stats: stats,
        });
    }

    /// The latest report for a scope/direction
    pub fn scope(&self, scope: &Scope, direction: Direction) -> Option<&ScopeReport> {
        self.scopes.iter().rev().find(|x| &x.scope == scope && x.direction == direction)
    }

    /// Whether every scope we touched came out clean
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.scopes.iter().all(|x| x.status == ScopeStatus::Success)
    }

    pub fn failed_scopes(&self) -> Vec<&ScopeReport> {
        self.scopes.iter().filter(|x| match x.status { ScopeStatus::Failed(_) => true, _ => false }).collect()
    }

    /// Whether any upload asked for another download
    pub fn resync_needed(&self) -> bool {
        self.scopes.iter().any(|x| x.direction == Direction::Upload && x.stats.resync_needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_scopes_and_warnings() {
        let mut report = SyncReport::new();
        let mut run = ScopeRun::new(&Scope::Primary, Direction::Download);
        run.skip(EntityType::Note, "n1", &NError::Internal(String::from("no usn")));
        report.add_scope(run, ScopeStatus::Success);
        let linked = Scope::Linked(String::from("ln1"));
        report.add_scope(ScopeRun::new(&linked, Direction::Download), ScopeStatus::Failed(String::from("cycle")));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].id, "n1");
        assert_eq!(report.scope(&Scope::Primary, Direction::Download).unwrap().stats.skipped, 1);
        assert!(report.scope(&Scope::Primary, Direction::Upload).is_none());
        assert!(!report.is_success());
        assert_eq!(report.failed_scopes().len(), 1);
        let json = jedi::stringify(&report.scopes[1]).unwrap();
        assert!(json.contains(r#""status":"failed","error":"cycle""#));
    }
}
