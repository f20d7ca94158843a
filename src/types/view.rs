//! Presentation views
//!
//! The import engine never formats output. It hands the presentation layer
//! a template name plus named values, the same way the CRM's page templates
//! receive assigned variables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Templates the presentation layer knows how to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewTemplate {
    ImportHeader,
    ImportPreview,
    /// Partial job, optionally with a continue affordance
    ImportStatus,
    /// Job deferred to the scheduler
    ImportSchedule,
    /// Finished job with final counts and undo affordance
    ImportResult,
    ImportUndoResult,
    /// Buttons shown when every listed job is done
    EndedImportButtons,
    /// Buttons shown while some job is still pending
    ImportDoneButtons,
    ErrorPage,
}

/// One template plus its assigned values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub template: ViewTemplate,
    pub vars: BTreeMap<String, Value>,
}

impl View {
    pub fn new(template: ViewTemplate) -> Self {
        Self {
            template,
            vars: BTreeMap::new(),
        }
    }

    /// Assign a named value
    pub fn assign(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.vars.insert(key.to_string(), value);
        self
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn error_page(code: &str, message: &str) -> Self {
        View::new(ViewTemplate::ErrorPage)
            .assign("ERROR_CODE", code)
            .assign("ERROR_MESSAGE", message)
    }
}

/// Ordered list of views making up one page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPage {
    pub views: Vec<View>,
}

impl StatusPage {
    pub fn push(&mut self, view: View) {
        self.views.push(view);
    }

    /// First view rendered with `template`
    #[cfg(test)]
    pub fn find(&self, template: ViewTemplate) -> Option<&View> {
        self.views.iter().find(|v| v.template == template)
    }

    pub fn count(&self, template: ViewTemplate) -> usize {
        self.views.iter().filter(|v| v.template == template).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_stores_json_values() {
        let view = View::new(ViewTemplate::ImportStatus)
            .assign("FOR_MODULE", "Contacts")
            .assign("CONTINUE_IMPORT", true)
            .assign("IMPORT_ID", 42);

        assert_eq!(view.get("FOR_MODULE"), Some(&Value::from("Contacts")));
        assert_eq!(view.get("CONTINUE_IMPORT"), Some(&Value::from(true)));
        assert_eq!(view.get("IMPORT_ID"), Some(&Value::from(42)));
    }

    #[test]
    fn test_error_page_carries_code_and_message() {
        let view = View::error_page("LOCKED", "module is locked");
        assert_eq!(view.template, ViewTemplate::ErrorPage);
        assert_eq!(view.get("ERROR_CODE"), Some(&Value::from("LOCKED")));
    }

    #[test]
    fn test_status_page_lookup() {
        let mut page = StatusPage::default();
        page.push(View::new(ViewTemplate::ImportHeader));
        page.push(View::new(ViewTemplate::ImportResult));
        page.push(View::new(ViewTemplate::ImportResult));

        assert_eq!(page.count(ViewTemplate::ImportResult), 2);
        assert!(page.find(ViewTemplate::ImportSchedule).is_none());
    }

    #[test]
    fn test_template_serializes_camel_case() {
        let json = serde_json::to_string(&ViewTemplate::ImportUndoResult).unwrap();
        assert_eq!(json, "\"importUndoResult\"");
    }
}
