//! Prompts for each stage of the text-to-SQL pipeline.
//!
//! - [`stages`] - table extraction, candidate generation and refinement
//! - [`merge`] - the selection stage's merge prompt and evidence rendering
//!
//! # Usage
//!
//! ```no_run
//! use sqlforge::prompts::{build_sql_generation_prompt, build_sql_refinement_prompt};
//!
//! let generation = build_sql_generation_prompt("CREATE TABLE singer (id INT);", "How many singers?");
//! let refinement = build_sql_refinement_prompt(
//!     "CREATE TABLE singer (id INT);",
//!     "How many singers?",
//!     "SELECT count(*) FROM singers",
//!     "no such table: singers",
//! );
//! ```

pub mod merge;
pub mod stages;

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};

pub use merge::{
    build_merge_prompt, evidence, render_rows, CandidateEvidence, MergePrompt, MERGE_SYSTEM_PROMPT,
    TRUNCATION_MARKER,
};
pub use stages::{
    build_sql_generation_prompt, build_sql_refinement_prompt, build_table_extraction_prompt,
    SQL_GENERATION_TEMPLATE, SQL_REFINEMENT_TEMPLATE, TABLE_EXTRACTION_TEMPLATE,
};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{(\w+)\}").expect("Invalid regex for template placeholders")
    })
}

/// Fills `{name}` placeholders in a single pass over `template`.
///
/// Inserted values are never rescanned, so braces inside a schema, query or
/// error message come through as written. Unknown placeholders are left as
/// they are.
pub(crate) fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let filled: Cow<'_, str> = placeholder().replace_all(template, |caps: &Captures<'_>| {
        values
            .iter()
            .find(|(name, _)| *name == &caps[1])
            .map(|(_, value)| (*value).to_string())
            .unwrap_or_else(|| caps[0].to_string())
    });
    filled.into_owned()
}
