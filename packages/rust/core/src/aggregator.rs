//! Per-model report documents built from result records.

use std::collections::{BTreeMap, HashSet};

use bulkresearch_shared::{ModelSelection, ResultMap, ResultRecord};

const SEPARATOR: &str = "\n---\n\n";

/// Success/failure counts over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub succeeded: usize,
    pub failed: usize,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Count successful and failed records.
pub fn tally<'a>(records: impl IntoIterator<Item = &'a ResultRecord>) -> Tally {
    records.into_iter().fold(Tally::default(), |mut t, r| {
        if r.is_success() {
            t.succeeded += 1;
        } else {
            t.failed += 1;
        }
        t
    })
}

/// Placeholder text stored in a model slot instead of real output.
pub fn is_placeholder(text: &str) -> bool {
    let text = text.trim_start();
    text.is_empty() || text.starts_with("Error:") || text.starts_with("No response from")
}

/// Builds one markdown document per selected model.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    models: Vec<String>,
}

impl ResultAggregator {
    pub fn new(models: &ModelSelection) -> Self {
        Self {
            models: models.selected().map(String::from).collect(),
        }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// One document per model over the records named in `order`.
    ///
    /// Entries are sorted by processing index; identifiers without a record
    /// are left out. Re-running over a larger map rebuilds every document
    /// from scratch.
    pub fn format(&self, records: &ResultMap, order: &[String]) -> BTreeMap<String, String> {
        let mut seen = HashSet::new();
        let mut present: Vec<&ResultRecord> = order
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| records.get(id))
            .collect();
        present.sort_by_key(|r| r.processing_index);

        self.models
            .iter()
            .map(|model| (model.clone(), self.document(model, &present)))
            .collect()
    }

    fn document(&self, model: &str, records: &[&ResultRecord]) -> String {
        let mut doc = format!("# {model} Research Results\n\nTotal entities: {}\n", records.len());

        let mut with_content = 0;
        for (i, record) in records.iter().enumerate() {
            if self.has_content(model, record) {
                with_content += 1;
            }
            doc.push_str(SEPARATOR);
            doc.push_str(&self.render_entry(model, i + 1, record));
        }

        if with_content > 0 {
            doc.push_str(SEPARATOR);
            doc.push_str(&format!(
                "_{with_content} of {} entities returned research from {model}._\n",
                records.len()
            ));
        }
        doc
    }

    fn has_content(&self, model: &str, record: &ResultRecord) -> bool {
        record.error.is_none()
            && record
                .per_model_output
                .as_ref()
                .and_then(|m| m.get(model))
                .is_some_and(|text| !is_placeholder(text))
    }

    /// Markdown section for one record, numbered from 1.
    pub fn render_entry(&self, model: &str, position: usize, record: &ResultRecord) -> String {
        let heading = if record.display_name == record.entity_id {
            format!("## {position}. {}\n\n", record.entity_id)
        } else {
            format!("## {position}. {} ({})\n\n", record.display_name, record.entity_id)
        };

        if let Some(error) = &record.error {
            return format!("{heading}**Error:** {error}\n");
        }

        let text = record
            .per_model_output
            .as_ref()
            .and_then(|m| m.get(model))
            .map(String::as_str)
            .unwrap_or("");

        if is_placeholder(text) {
            let message = text.trim().strip_prefix("Error:").unwrap_or(text).trim();
            let message = if message.is_empty() {
                format!("No response from {model}")
            } else {
                message.to_string()
            };
            format!("{heading}**Error:** {message}\n")
        } else {
            format!("{heading}{}\n", text.trim_end())
        }
    }
}
