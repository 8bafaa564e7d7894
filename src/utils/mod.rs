//! Shared utility functions for sqlforge.
//!
//! Currently this is answer extraction from model responses.

pub mod answer_extraction;

pub use answer_extraction::{
    extract_merge_answer, extract_sql_answer, extract_table_answer, ExtractionError,
};
