use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Class index to label mapping of a classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    id2label: Vec<String>,
}

impl Labels {
    pub fn new(id2label: Vec<String>) -> Self {
        Self { id2label }
    }

    /// Reads one label per line; the line number is the class index.
    pub fn load(filepath: &Path) -> io::Result<Self> {
        let file = File::open(filepath)?;
        let reader = io::BufReader::new(file);
        let mut id2label = Vec::new();

        for line_result in reader.lines() {
            let line = line_result?;
            let label = line.trim();
            if !label.is_empty() {
                id2label.push(label.to_string());
            }
        }

        if id2label.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("No labels found in {}", filepath.display()),
            ));
        }

        Ok(Self { id2label })
    }

    pub fn len(&self) -> usize {
        self.id2label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2label.is_empty()
    }

    /// Label for a class index. Indices the model config does not name fall
    /// back to the binary convention `0 = REAL`, `1 = FAKE`.
    pub fn label_for(&self, index: usize) -> String {
        match self.id2label.get(index) {
            Some(label) => label.clone(),
            None if index == 1 => "FAKE".to_string(),
            None => "REAL".to_string(),
        }
    }
}
