use crate::core::languages::LanguageSpec;

/// Turns submitted code into a complete program for `language`.
///
/// Under auto-wrap the produced program reads one JSON argument per stdin line
/// and prints one JSON result line.
pub trait CodeAdapter: std::fmt::Debug + Send + Sync {
    fn wrap(&self, language: &LanguageSpec, source: &str) -> String;
}

/// Writes the submission as-is.
#[derive(Clone, Debug, Default)]
pub struct VerbatimAdapter;

impl CodeAdapter for VerbatimAdapter {
    fn wrap(&self, _language: &LanguageSpec, source: &str) -> String {
        source.to_string()
    }
}
