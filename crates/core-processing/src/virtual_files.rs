//! Virtual files: AINSERT buffers, preprocessor output, macro sources.
//!
//! Synthesized content becomes a first-class file under a
//! `hlasm://<id>/<name>.hlasm` URI so diagnostics and navigation can point
//! into it. The monitor owns the content; the analyzer keeps only the
//! handles it was given.

use std::collections::HashMap;

/// Handle of a published virtual file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFileHandle {
    pub id: u64,
    pub uri: String,
}

/// URI of a virtual file.
pub fn virtual_uri(id: u64, name: &str) -> String {
    format!("hlasm://{id}/{name}.hlasm")
}

/// Receives synthesized file content as it is produced.
pub trait VirtualFileMonitor {
    fn file_generated(&mut self, name: &str, content: &str) -> VirtualFileHandle;
}

/// Default monitor: keeps everything in a map for later inspection.
#[derive(Debug, Default)]
pub struct VirtualFileRegistry {
    next_id: u64,
    files: HashMap<u64, (String, String)>,
}

impl VirtualFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self, id: u64) -> Option<&str> {
        self.files.get(&id).map(|(_, content)| content.as_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl VirtualFileMonitor for VirtualFileRegistry {
    fn file_generated(&mut self, name: &str, content: &str) -> VirtualFileHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.files.insert(id, (name.to_owned(), content.to_owned()));
        VirtualFileHandle {
            id,
            uri: virtual_uri(id, name),
        }
    }
}
