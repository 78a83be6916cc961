//! Definition resolver — lazily materializes the metric definitions a
//! template needs, one batch query + one batch insert.
//!
//! Each definition is independent: a failed insert is recorded against
//! its metric and the rest resolve normally. Callers treat a missing
//! entry in the returned map as "skip this template item for this run".

use std::collections::HashMap;

use foliopulse_core::Result;
use foliopulse_core::model::{MetricDefinition, PeriodType, RunError, TemplateItem, new_id};
use foliopulse_store::MetricStore;

/// Resolution result: (metric name, period type) → definition id, plus
/// the reverse name lookup the dispatcher needs, plus per-item failures.
pub struct ResolvedDefinitions {
    pub ids_by_key: HashMap<(String, PeriodType), String>,
    pub names_by_id: HashMap<String, String>,
    pub errors: Vec<RunError>,
}

impl ResolvedDefinitions {
    pub fn definition_ids(&self) -> Vec<String> {
        self.ids_by_key.values().cloned().collect()
    }
}

/// Ensure definitions exist for every (metric name, period type) pair in
/// `items`, creating missing ones for the investor in one batch.
pub fn resolve_definitions(
    store: &MetricStore,
    investor_id: &str,
    items: &[TemplateItem],
) -> Result<ResolvedDefinitions> {
    let mut needed: Vec<&TemplateItem> = Vec::new();
    for item in items {
        let dup = needed
            .iter()
            .any(|n| n.metric_name == item.metric_name && n.period_type == item.period_type);
        if !dup {
            needed.push(item);
        }
    }
    let mut names: Vec<String> = Vec::new();
    for item in &needed {
        if !names.contains(&item.metric_name) {
            names.push(item.metric_name.clone());
        }
    }

    let existing = store.definitions_by_names(investor_id, &names)?;
    let mut ids_by_key: HashMap<(String, PeriodType), String> = existing
        .iter()
        .map(|d| ((d.name.clone(), d.period_type), d.id.clone()))
        .collect();

    let missing: Vec<MetricDefinition> = needed
        .iter()
        .filter(|item| !ids_by_key.contains_key(&(item.metric_name.clone(), item.period_type)))
        .map(|item| MetricDefinition {
            id: new_id(),
            investor_id: investor_id.to_string(),
            name: item.metric_name.clone(),
            period_type: item.period_type,
            data_type: item.data_type,
        })
        .collect();

    let mut errors = Vec::new();
    if !missing.is_empty() {
        tracing::debug!("Creating {} missing metric definition(s)", missing.len());
        for (metric, message) in store.insert_definitions(&missing)? {
            errors.push(RunError::for_metric(metric, format!("definition insert: {message}")));
        }
        // Re-select: picks up our inserts and anything a concurrent run
        // created first (the unique index makes both the same row).
        for def in store.definitions_by_names(investor_id, &names)? {
            ids_by_key.entry((def.name.clone(), def.period_type)).or_insert(def.id);
        }
    }

    // Keep only the pairs the template actually asked for.
    let wanted: Vec<(String, PeriodType)> =
        needed.iter().map(|i| (i.metric_name.clone(), i.period_type)).collect();
    ids_by_key.retain(|key, _| wanted.contains(key));

    let names_by_id =
        ids_by_key.iter().map(|((name, _), id)| (id.clone(), name.clone())).collect();

    Ok(ResolvedDefinitions { ids_by_key, names_by_id, errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use foliopulse_core::model::DataType;

    fn item(name: &str, period: PeriodType) -> TemplateItem {
        TemplateItem {
            metric_name: name.into(),
            period_type: period,
            data_type: DataType::Currency,
        }
    }

    #[test]
    fn creates_missing_and_reuses_existing() {
        let store = MetricStore::open_in_memory().unwrap();
        let items = vec![item("Revenue", PeriodType::Quarterly), item("Burn Rate", PeriodType::Quarterly)];

        let first = resolve_definitions(&store, "inv-1", &items).unwrap();
        assert_eq!(first.ids_by_key.len(), 2);
        assert!(first.errors.is_empty());

        // second resolution never creates duplicates
        let second = resolve_definitions(&store, "inv-1", &items).unwrap();
        assert_eq!(second.ids_by_key, first.ids_by_key);
        assert_eq!(store.definitions_by_names("inv-1", &["Revenue".into()]).unwrap().len(), 1);
    }

    #[test]
    fn same_name_different_period_is_distinct() {
        let store = MetricStore::open_in_memory().unwrap();
        let items = vec![item("Revenue", PeriodType::Quarterly), item("Revenue", PeriodType::Annual)];
        let resolved = resolve_definitions(&store, "inv-1", &items).unwrap();
        assert_eq!(resolved.ids_by_key.len(), 2);
    }

    #[test]
    fn investors_do_not_share_definitions() {
        let store = MetricStore::open_in_memory().unwrap();
        let items = vec![item("Revenue", PeriodType::Quarterly)];
        let a = resolve_definitions(&store, "inv-a", &items).unwrap();
        let b = resolve_definitions(&store, "inv-b", &items).unwrap();
        let key = ("Revenue".to_string(), PeriodType::Quarterly);
        assert_ne!(a.ids_by_key[&key], b.ids_by_key[&key]);
    }
}
