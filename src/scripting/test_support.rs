//! Fakes for the protocol and UI collaborators used across scripting tests.
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::HostConfig;
use crate::protocol::Outbound;
use crate::scripting::menu::{MenuItem, MenuPresenter};

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Boolean(String, bool),
    Number(String, f64),
    String(String, String),
    Nil(String),
}

#[derive(Default, Clone)]
pub struct RecordingOutbound {
    sent: Arc<Mutex<Vec<Sent>>>,
    reject_numbers: bool,
}

impl RecordingOutbound {
    pub fn rejecting_numbers() -> Self {
        Self {
            reject_numbers: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

impl Outbound for RecordingOutbound {
    fn send_boolean(&self, address: &str, value: bool) -> Result<(), String> {
        self.sent.lock().unwrap().push(Sent::Boolean(address.into(), value));
        Ok(())
    }

    fn send_number(&self, address: &str, value: f64) -> Result<(), String> {
        if self.reject_numbers {
            return Err(format!("unknown endpoint type for {address}"));
        }
        self.sent.lock().unwrap().push(Sent::Number(address.into(), value));
        Ok(())
    }

    fn send_string(&self, address: &str, value: &str) -> Result<(), String> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::String(address.into(), value.into()));
        Ok(())
    }

    fn send_nil(&self, address: &str) -> Result<(), String> {
        self.sent.lock().unwrap().push(Sent::Nil(address.into()));
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct RecordingPresenter {
    menus: Arc<Mutex<Vec<Vec<MenuItem>>>>,
}

impl RecordingPresenter {
    pub fn menus(&self) -> Vec<Vec<MenuItem>> {
        self.menus.lock().unwrap().clone()
    }
}

impl MenuPresenter for RecordingPresenter {
    fn present(&self, items: &[MenuItem]) {
        self.menus.lock().unwrap().push(items.to_vec());
    }
}

/// Writes `files` (relative path, contents) under `root`, creating parents.
pub fn write_scripts(root: &Path, files: &[(&str, &str)]) {
    for (rel, contents) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}

/// A script root in a temp dir with its `io_dir` created.
pub fn host_config() -> (tempfile::TempDir, HostConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig::new(dir.path());
    std::fs::create_dir_all(&config.io_root).unwrap();
    (dir, config)
}
