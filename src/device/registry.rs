//! Freshness and dependency bookkeeping of the declared variables.

use super::variable::{QueryTimeout, Variable, VariableInfo, VariableValue};
use crate::error::{AppResult, DaqError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Engine-maintained variable holding the coarse device state.
pub const STATUS_VARIABLE: &str = "__status__";
/// Engine-maintained variable holding a human-readable detail of the status.
pub const AUX_STATUS_VARIABLE: &str = "__auxstatus__";

/// All variables of one backend, in declaration order.
#[derive(Debug)]
pub struct VariableRegistry {
    variables: Vec<Variable>,
    index: HashMap<String, usize>,
    /// source index -> indices of the variables declaring it in `depends_from`
    dependents: HashMap<usize, Vec<usize>>,
}

impl VariableRegistry {
    /// Builds the registry from the protocol declarations, appending the two
    /// status variables.
    pub fn new(declared: Vec<VariableInfo>) -> AppResult<Self> {
        let mut infos = declared;
        for builtin in [STATUS_VARIABLE, AUX_STATUS_VARIABLE] {
            if infos.iter().any(|info| info.name == builtin) {
                return Err(DaqError::Configuration(format!(
                    "Variable {builtin} is reserved"
                )));
            }
            infos.push(VariableInfo::new(builtin).passive());
        }

        let mut index = HashMap::with_capacity(infos.len());
        for (i, info) in infos.iter().enumerate() {
            if index.insert(info.name.clone(), i).is_some() {
                return Err(DaqError::Configuration(format!(
                    "Variable {} declared twice",
                    info.name
                )));
            }
        }

        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, info) in infos.iter().enumerate() {
            for source in &info.depends_from {
                let source_idx = *index.get(source).ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "Variable {} depends from undeclared variable {source}",
                        info.name
                    ))
                })?;
                dependents.entry(source_idx).or_default().push(i);
            }
        }

        Ok(Self {
            variables: infos.into_iter().map(Variable::new).collect(),
            index,
            dependents,
        })
    }

    fn position(&self, name: &str) -> AppResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| DaqError::UnknownVariable(name.to_string()))
    }

    pub fn get(&self, name: &str) -> AppResult<&Variable> {
        Ok(&self.variables[self.position(name)?])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Name and timeout (seconds) of every variable, for `variablenames`.
    pub fn names_and_timeouts(&self) -> Vec<(String, Option<f64>)> {
        self.variables
            .iter()
            .map(|v| (v.name().to_string(), v.timeout().as_secs_f64()))
            .collect()
    }

    /// Stores a new value. Returns true if the value changed.
    ///
    /// The reply also satisfies every variable depending from this one, so
    /// their outstanding-query markers are cleared as well.
    pub fn update(&mut self, name: &str, value: VariableValue, now: Instant) -> AppResult<bool> {
        let idx = self.position(name)?;
        if let Some(deps) = self.dependents.get(&idx) {
            for &dep in deps {
                self.variables[dep].clear_query();
            }
        }
        Ok(self.variables[idx].update(value, now))
    }

    /// Whether the variable is older than its timeout.
    pub fn overdue(&self, name: &str, now: Instant) -> AppResult<bool> {
        Ok(self.get(name)?.is_overdue(now))
    }

    fn sources(&self, idx: usize) -> Vec<usize> {
        let info = self.variables[idx].info();
        if info.depends_from.is_empty() {
            vec![idx]
        } else {
            info.depends_from
                .iter()
                .filter_map(|name| self.index.get(name).copied())
                .collect()
        }
    }

    /// True if neither the variable nor any of its sources awaits a reply.
    pub fn queriable(&self, name: &str) -> AppResult<bool> {
        let idx = self.position(name)?;
        Ok(!self.variables[idx].query_outstanding()
            && self
                .sources(idx)
                .into_iter()
                .all(|s| !self.variables[s].query_outstanding()))
    }

    /// Marks the dependency group of `name` as queried and returns the source
    /// variables for which a wire query has to be issued.
    ///
    /// Sources already awaiting a reply are skipped and keep their original
    /// query timestamp. With `force`, the next update of `name` reports a
    /// change even if the value stays the same.
    pub fn begin_query(&mut self, name: &str, force: bool, now: Instant) -> AppResult<Vec<String>> {
        let idx = self.position(name)?;
        if force {
            self.variables[idx].force_change();
        }
        let mut to_query = Vec::new();
        for source in self.sources(idx) {
            if self.variables[source].query_outstanding() {
                continue;
            }
            self.variables[source].mark_queried(now);
            if let Some(deps) = self.dependents.get(&source) {
                for &dep in deps {
                    self.variables[dep].mark_queried(now);
                }
            }
            to_query.push(self.variables[source].name().to_string());
        }
        Ok(to_query)
    }

    /// Variables the auto-querier should refresh now, urgent ones first, then
    /// the most overdue.
    pub fn query_candidates(&self, now: Instant) -> Vec<String> {
        let mut candidates: Vec<(&Variable, f64)> = self
            .variables
            .iter()
            .enumerate()
            .filter(|(i, v)| {
                v.auto_queryable()
                    && !v.query_outstanding()
                    && self
                        .sources(*i)
                        .into_iter()
                        .all(|s| !self.variables[s].query_outstanding())
            })
            .map(|(_, v)| (v, v.overdue_secs(now)))
            .filter(|(_, overdue)| *overdue > 0.0)
            .collect();
        candidates.sort_by(|(a, a_overdue), (b, b_overdue)| {
            (!a.info().urgent)
                .cmp(&!b.info().urgent)
                .then_with(|| b_overdue.total_cmp(a_overdue))
        });
        candidates
            .into_iter()
            .map(|(v, _)| v.name().to_string())
            .collect()
    }

    /// How long the auto-querier may sleep. `None` means until woken.
    pub fn next_poll_delay(&self, now: Instant, fast_poll: Duration) -> Option<Duration> {
        let shortest = self
            .variables
            .iter()
            .filter_map(|v| match v.timeout() {
                QueryTimeout::Every(d) => Some(d),
                QueryTimeout::Once | QueryTimeout::Passive => None,
            })
            .min();
        let pending = self
            .variables
            .iter()
            .any(|v| v.auto_queryable() && v.is_overdue(now) && !v.query_outstanding());
        if pending {
            Some(shortest.map_or(fast_poll, |d| d.min(fast_poll)))
        } else {
            shortest
        }
    }

    /// Forgets every outstanding query.
    pub fn clear_outstanding(&mut self) {
        for variable in &mut self.variables {
            variable.clear_query();
        }
    }

    pub fn all_have_values(&self) -> bool {
        self.variables.iter().all(Variable::has_value)
    }

    pub fn missing_values(&self) -> Vec<String> {
        self.variables
            .iter()
            .filter(|v| !v.has_value())
            .map(|v| v.name().to_string())
            .collect()
    }

    /// Age of every outstanding query.
    pub fn outstanding_ages(&self, now: Instant) -> Vec<(String, Duration)> {
        self.variables
            .iter()
            .filter_map(|v| {
                v.last_query()
                    .map(|t| (v.name().to_string(), now.saturating_duration_since(t)))
            })
            .collect()
    }

    /// Overdue time in seconds of every variable that has a value and is overdue.
    pub fn overdue_ages(&self, now: Instant) -> Vec<(String, f64)> {
        self.variables
            .iter()
            .filter(|v| v.has_value())
            .map(|v| (v.name().to_string(), v.overdue_secs(now)))
            .filter(|(_, overdue)| *overdue > 0.0)
            .collect()
    }

    /// Overrides the query timeout of a variable until reset.
    pub fn set_timeout(&mut self, name: &str, timeout: QueryTimeout) -> AppResult<()> {
        let idx = self.position(name)?;
        self.variables[idx].set_timeout(Some(timeout));
        Ok(())
    }

    pub fn reset_timeout(&mut self, name: &str) -> AppResult<()> {
        let idx = self.position(name)?;
        self.variables[idx].set_timeout(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> VariableRegistry {
        VariableRegistry::new(vec![
            VariableInfo::new("a").every(Duration::from_secs(1)),
            VariableInfo::new("b").depends_from(["a"]),
            VariableInfo::new("c").every(Duration::from_secs(2)).urgent(),
            VariableInfo::new("version").once(),
        ])
        .unwrap()
    }

    #[test]
    fn test_builtin_variables_are_appended() {
        let reg = registry();
        assert_eq!(reg.len(), 6);
        assert!(!reg.get(STATUS_VARIABLE).unwrap().auto_queryable());
        let names = reg.names_and_timeouts();
        assert_eq!(names[0], ("a".to_string(), Some(1.0)));
        assert_eq!(names[3], ("version".to_string(), None));
    }

    #[test]
    fn test_reserved_and_duplicate_names_rejected() {
        assert!(VariableRegistry::new(vec![VariableInfo::new(STATUS_VARIABLE)]).is_err());
        assert!(VariableRegistry::new(vec![VariableInfo::new("x"), VariableInfo::new("x")]).is_err());
        assert!(VariableRegistry::new(vec![VariableInfo::new("x").depends_from(["nope"])]).is_err());
    }

    #[test]
    fn test_unknown_variable() {
        let reg = registry();
        let err = reg.get("missing").unwrap_err();
        assert_eq!(err.to_string(), "Variable missing does not exist");
    }

    #[test]
    fn test_update_reports_changes_only() {
        let mut reg = registry();
        let now = Instant::now();
        assert!(reg.update("a", 1.0.into(), now).unwrap());
        assert!(!reg.update("a", 1.0.into(), now).unwrap());
        assert!(reg.update("a", 2.0.into(), now).unwrap());
    }

    #[test]
    fn test_dependency_group_is_queried_once() {
        let mut reg = registry();
        let now = Instant::now();

        assert_eq!(reg.begin_query("b", false, now).unwrap(), vec!["a".to_string()]);
        assert!(reg.get("a").unwrap().query_outstanding());
        assert!(reg.get("b").unwrap().query_outstanding());
        assert!(!reg.queriable("a").unwrap());
        assert!(!reg.queriable("b").unwrap());
        // the group is already outstanding
        assert!(reg.begin_query("a", false, now).unwrap().is_empty());
        assert!(reg.begin_query("b", false, now).unwrap().is_empty());
    }

    #[test]
    fn test_dependent_satisfied_by_source_reply() {
        let mut reg = registry();
        let start = Instant::now();
        reg.begin_query("a", false, start).unwrap();
        // a reply for "a" also carries "b"
        reg.update("a", 1.into(), start).unwrap();
        reg.update("b", 2.into(), start).unwrap();

        let later = start + Duration::from_millis(500);
        assert!(!reg.overdue("b", later).unwrap());
        assert!(reg.queriable("b").unwrap());
        assert!(reg.outstanding_ages(later).is_empty());
    }

    #[test]
    fn test_source_reply_clears_dependent_marker() {
        let mut reg = registry();
        let now = Instant::now();
        reg.begin_query("a", false, now).unwrap();
        reg.update("a", 1.into(), now).unwrap();
        assert!(!reg.get("b").unwrap().query_outstanding());
    }

    #[test]
    fn test_candidates_urgent_first_then_most_overdue() {
        let mut reg = registry();
        let start = Instant::now();
        for name in ["a", "b", "c", "version"] {
            reg.update(name, 0.into(), start).unwrap();
        }
        let now = start + Duration::from_secs(5);
        // c is urgent; a and b are both 4s overdue, declaration order kept
        assert_eq!(reg.query_candidates(now), vec!["c", "a", "b"]);

        reg.begin_query("a", false, now).unwrap();
        assert_eq!(reg.query_candidates(now), vec!["c"]);
    }

    #[test]
    fn test_never_seen_variables_are_candidates() {
        let reg = registry();
        let now = Instant::now();
        assert_eq!(reg.query_candidates(now), vec!["c", "a", "b", "version"]);
        assert_eq!(reg.missing_values().len(), 6);
        assert!(!reg.all_have_values());
    }

    #[test]
    fn test_next_poll_delay() {
        let mut reg = registry();
        let start = Instant::now();
        let fast = Duration::from_millis(100);
        // nothing has a value yet
        assert_eq!(reg.next_poll_delay(start, fast), Some(fast));

        for name in ["a", "b", "c", "version"] {
            reg.update(name, 0.into(), start).unwrap();
        }
        assert_eq!(reg.next_poll_delay(start, fast), Some(Duration::from_secs(1)));

        let mut only_once = VariableRegistry::new(vec![VariableInfo::new("id").once()]).unwrap();
        only_once.update("id", 1.into(), start).unwrap();
        assert_eq!(only_once.next_poll_delay(start, fast), None);
    }

    #[test]
    fn test_clear_outstanding_and_ages() {
        let mut reg = registry();
        let start = Instant::now();
        reg.begin_query("c", false, start).unwrap();
        let ages = reg.outstanding_ages(start + Duration::from_secs(3));
        assert_eq!(ages, vec![("c".to_string(), Duration::from_secs(3))]);
        reg.clear_outstanding();
        assert!(reg.outstanding_ages(start).is_empty());
    }

    #[test]
    fn test_forced_query_reports_change() {
        let mut reg = registry();
        let now = Instant::now();
        reg.update("version", "1.0".into(), now).unwrap();
        assert!(!reg.update("version", "1.0".into(), now).unwrap());
        reg.begin_query("version", true, now).unwrap();
        assert!(reg.update("version", "1.0".into(), now).unwrap());
    }

    #[test]
    fn test_runtime_timeout() {
        let mut reg = registry();
        let start = Instant::now();
        reg.update("c", 0.into(), start).unwrap();
        let later = start + Duration::from_millis(500);
        assert!(!reg.overdue("c", later).unwrap());
        reg.set_timeout("c", QueryTimeout::Every(Duration::from_millis(100))).unwrap();
        assert!(reg.overdue("c", later).unwrap());
        assert_eq!(reg.overdue_ages(later).len(), 1);
        reg.reset_timeout("c").unwrap();
        assert!(!reg.overdue("c", later).unwrap());
    }
}
