use serde::{Deserialize, Serialize};

/// A named grouping of steps, derived from step configuration.
///
/// Membership is stored as step file paths; the registry owns the steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<String>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
        }
    }

    pub fn contains(&self, file_path: &str) -> bool {
        self.steps.iter().any(|p| p == file_path)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn add_step(&mut self, file_path: &str) {
        if !self.contains(file_path) {
            self.steps.push(file_path.to_string());
        }
    }

    pub fn remove_step(&mut self, file_path: &str) {
        self.steps.retain(|p| p != file_path);
    }
}
