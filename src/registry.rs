//! Identity mapping between front-end ids and remote side names.

use indexmap::IndexMap;
use std::collections::HashMap;

/// Thread as seen by the front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

/// Stack frame of a remote thread, `index` is used as frame id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: i64,
    pub thread_name: String,
    pub source_name: String,
    pub source_path: String,
    pub line: i64,
}

/// Variable with already rendered value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

#[derive(Default)]
pub struct Registry {
    /// Thread name to thread id, in first seen order.
    threads: IndexMap<String, i64>,
    next_thread_id: i64,
    frames: Vec<Frame>,
    next_handle: i64,
    handles: HashMap<i64, Vec<Variable>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn assign(&mut self, name: &str) -> i64 {
        if let Some(id) = self.threads.get(name) {
            return *id;
        }
        let id = self.next_thread_id;
        self.next_thread_id += 1;
        self.threads.insert(name.to_string(), id);
        id
    }

    /// Replace thread table with reported names.
    /// Names reported before keep their id, new names get fresh ids, missing names are dropped.
    pub fn upsert_threads(&mut self, names: &[String]) -> Vec<Thread> {
        self.threads.retain(|name, _| names.contains(name));
        for name in names {
            self.assign(name);
        }
        self.threads()
    }

    /// Return thread for a name, create it if name never seen before.
    pub fn ensure_thread(&mut self, name: &str) -> Thread {
        Thread {
            id: self.assign(name),
            name: name.to_string(),
        }
    }

    pub fn threads(&self) -> Vec<Thread> {
        self.threads
            .iter()
            .map(|(name, id)| Thread {
                id: *id,
                name: name.clone(),
            })
            .collect()
    }

    pub fn thread_by_name(&self, name: &str) -> Option<Thread> {
        self.threads.get(name).map(|id| Thread {
            id: *id,
            name: name.to_string(),
        })
    }

    pub fn thread_by_id(&self, id: i64) -> Option<Thread> {
        self.threads
            .iter()
            .find(|(_, tid)| **tid == id)
            .map(|(name, _)| Thread {
                id,
                name: name.clone(),
            })
    }

    /// Replace current frame table, only frames of one thread are held at a time.
    pub fn set_frames(&mut self, frames: Vec<Frame>) {
        self.frames = frames;
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, index: i64) -> Option<&Frame> {
        self.frames.iter().find(|f| f.index == index)
    }

    /// Store variable list and return a handle for it. Handles are never reused.
    pub fn mint_variable_handle(&mut self, vars: Vec<Variable>) -> i64 {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.handles.insert(handle, vars);
        handle
    }

    pub fn resolve_handle(&self, handle: i64) -> Option<&[Variable]> {
        self.handles.get(&handle).map(Vec::as_slice)
    }
}
