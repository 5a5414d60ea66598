//! In-memory persistence for code units, their results and the objects
//! executions read.

use std::collections::HashMap;

use crate::{
    code::{UserCode, UserCodeExecutionResult},
    script::Value,
    uid::Uid,
};

/// Resolves object identifiers to the values handed to user code.
pub trait ActionStore {
    fn get(&self, id: &Uid) -> Option<Value>;
}

#[derive(Debug, Default)]
pub struct InMemoryActionStore {
    objects: HashMap<Uid, Value>,
}

impl InMemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under a fresh identifier.
    pub fn put(&mut self, value: Value) -> Uid {
        let id = Uid::new();
        self.objects.insert(id, value);
        id
    }

    pub fn insert(&mut self, id: Uid, value: Value) {
        self.objects.insert(id, value);
    }
}

impl ActionStore for InMemoryActionStore {
    fn get(&self, id: &Uid) -> Option<Value> {
        self.objects.get(id).cloned()
    }
}

/// Code units by id, content hash and user-unique name.
#[derive(Debug, Default)]
pub struct UserCodeStore {
    by_id: HashMap<Uid, UserCode>,
    by_hash: HashMap<String, Uid>,
    by_user_unique_name: HashMap<String, Vec<Uid>>,
    results: HashMap<Uid, Vec<UserCodeExecutionResult>>,
}

impl UserCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: UserCode) {
        self.by_hash.insert(code.code_hash.clone(), code.id);
        self.by_user_unique_name
            .entry(code.user_unique_func_name.clone())
            .or_default()
            .push(code.id);
        self.by_id.insert(code.id, code);
    }

    pub fn get(&self, id: &Uid) -> Option<&UserCode> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &Uid) -> Option<&mut UserCode> {
        self.by_id.get_mut(id)
    }

    pub fn get_by_hash(&self, code_hash: &str) -> Option<&UserCode> {
        self.by_hash.get(code_hash).and_then(|id| self.by_id.get(id))
    }

    /// Most recent submission under `user_unique_func_name`.
    pub fn latest_for(&self, user_unique_func_name: &str) -> Option<&UserCode> {
        self.by_user_unique_name
            .get(user_unique_func_name)
            .and_then(|ids| ids.last())
            .and_then(|id| self.by_id.get(id))
    }

    pub fn append_result(&mut self, result: UserCodeExecutionResult) {
        self.results
            .entry(result.user_code_id)
            .or_default()
            .push(result);
    }

    pub fn results_for(&self, id: &Uid) -> &[UserCodeExecutionResult] {
        self.results.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
