//! Validated floor-plan storage (§3 `Plan`, §6 Plan file, §7 `PlanInvalid`).
//!
//! `PlanStore` holds at most one validated `Plan`, swapped in atomically.
//! A load failure never disturbs the plan already in memory — callers see
//! a `PlanInvalid` error and the previous (or absent) plan is unchanged.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};
use types::Plan;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("could not read plan file: {0}")]
    Io(#[from] std::io::Error),
    #[error("plan could not be parsed as JSON or YAML: {0}")]
    Parse(String),
    #[error("plan is invalid: {0}")]
    Invalid(String),
}

fn validate(plan: &Plan) -> Result<(), PlanError> {
    if plan.contour.len() < 3 {
        return Err(PlanError::Invalid(
            "contour must contain at least 3 points".to_string(),
        ));
    }
    Ok(())
}

/// Parse `text` as a `Plan`, sniffing the source format from `extension`
/// (lowercased, no leading dot). `.yaml`/`.yml` parses as YAML, `.json` as
/// JSON; any other extension (or none) tries JSON first, falling back to
/// YAML on failure — the same "sniff, then fall back" rule as the plan
/// loader this is ported from.
pub fn parse_plan(text: &str, extension: Option<&str>) -> Result<Plan, PlanError> {
    let parsed = match extension {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(text).map_err(|e| PlanError::Parse(e.to_string()))
        }
        Some("json") => serde_json::from_str(text).map_err(|e| PlanError::Parse(e.to_string())),
        _ => serde_json::from_str(text)
            .or_else(|_| serde_yaml::from_str(text))
            .map_err(|e| PlanError::Parse(e.to_string())),
    };
    let plan: Plan = parsed?;
    validate(&plan)?;
    Ok(plan)
}

/// Atomic in-memory store for the active floor plan.
#[derive(Clone, Default)]
pub struct PlanStore {
    current: Arc<Mutex<Option<Arc<Plan>>>>,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a plan from `path`, then install it. On failure,
    /// the previously installed plan (if any) is left untouched.
    pub fn load_from_file(&self, path: &Path) -> Result<Arc<Plan>, PlanError> {
        let text = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        let plan = parse_plan(&text, extension.as_deref())?;
        debug!(path = %path.display(), points = plan.contour.len(), "plan loaded");
        Ok(self.install(plan))
    }

    /// Install an already-parsed plan directly, bypassing file I/O.
    pub fn load_from_json(&self, text: &str) -> Result<Arc<Plan>, PlanError> {
        let plan = parse_plan(text, Some("json"))?;
        Ok(self.install(plan))
    }

    fn install(&self, plan: Plan) -> Arc<Plan> {
        let plan = Arc::new(plan);
        *self.current.lock().unwrap() = Some(plan.clone());
        plan
    }

    /// A shared snapshot of the currently installed plan, if any. Readers
    /// take this once at the start of an operation rather than holding the
    /// lock across a read (§9 "plan reference is swapped atomically").
    pub fn get(&self) -> Option<Arc<Plan>> {
        self.current.lock().unwrap().clone()
    }

    /// Load the startup default plan at `path` if it exists; a missing or
    /// invalid file is logged and leaves the store empty rather than
    /// failing startup.
    pub fn load_default(&self, path: &Path) {
        if !path.exists() {
            debug!(path = %path.display(), "no default plan file present");
            return;
        }
        match self.load_from_file(path) {
            Ok(_) => debug!(path = %path.display(), "default plan installed"),
            Err(err) => warn!(path = %path.display(), %err, "default plan failed to load"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_JSON: &str = r#"{"contour": [[0,0],[100,0],[100,100],[0,100]]}"#;
    const VALID_YAML: &str = "contour:\n  - [0, 0]\n  - [100, 0]\n  - [100, 100]\n";
    const SHORT_CONTOUR: &str = r#"{"contour": [[0,0],[100,0]]}"#;

    #[test]
    fn parses_json_by_extension() {
        let plan = parse_plan(VALID_JSON, Some("json")).unwrap();
        assert_eq!(plan.contour.len(), 4);
    }

    #[test]
    fn parses_yaml_by_extension() {
        let plan = parse_plan(VALID_YAML, Some("yaml")).unwrap();
        assert_eq!(plan.contour.len(), 3);
    }

    #[test]
    fn sniffs_json_first_with_no_extension_hint() {
        let plan = parse_plan(VALID_JSON, None).unwrap();
        assert_eq!(plan.contour.len(), 4);
    }

    #[test]
    fn falls_back_to_yaml_when_json_parse_fails() {
        let plan = parse_plan(VALID_YAML, None).unwrap();
        assert_eq!(plan.contour.len(), 3);
    }

    #[test]
    fn rejects_short_contour() {
        let result = parse_plan(SHORT_CONTOUR, Some("json"));
        assert!(matches!(result, Err(PlanError::Invalid(_))));
    }

    #[test]
    fn store_keeps_previous_plan_on_failed_install() {
        let store = PlanStore::new();
        store.load_from_json(VALID_JSON).unwrap();
        assert!(store.get().is_some());

        let err = store.load_from_json(SHORT_CONTOUR);
        assert!(err.is_err());
        assert_eq!(store.get().unwrap().contour.len(), 4);
    }

    #[test]
    fn get_returns_none_before_any_load() {
        let store = PlanStore::new();
        assert!(store.get().is_none());
    }

    #[test]
    fn load_default_tolerates_missing_file() {
        let store = PlanStore::new();
        store.load_default(Path::new("/nonexistent/plan.json"));
        assert!(store.get().is_none());
    }
}
