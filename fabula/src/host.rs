use std::collections::HashMap;

/// Named byte buffers owned by a game, backing the file opcodes.
///
/// Keys are `(game id, file name)`; a browser host would put this on local
/// storage, the terminal host keeps it in memory or on disk.
pub trait FileStore {
    fn list(&self, game_id: &str) -> Vec<String>;
    fn read(&self, game_id: &str, name: &str) -> Option<Vec<u8>>;
    fn write(&mut self, game_id: &str, name: &str, bytes: &[u8]);
    /// Returns whether the file existed.
    fn delete(&mut self, game_id: &str, name: &str) -> bool;
}

/// Key/value settings surface behind `GetSetting`/`SetSetting`.
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: HashMap<(String, String), Vec<u8>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemoryFileStore {
    fn list(&self, game_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter(|(game, _)| game == game_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn read(&self, game_id: &str, name: &str) -> Option<Vec<u8>> {
        self.files
            .get(&(game_id.to_string(), name.to_string()))
            .cloned()
    }

    fn write(&mut self, game_id: &str, name: &str, bytes: &[u8]) {
        self.files
            .insert((game_id.to_string(), name.to_string()), bytes.to_vec());
    }

    fn delete(&mut self, game_id: &str, name: &str) -> bool {
        self.files
            .remove(&(game_id.to_string(), name.to_string()))
            .is_some()
    }
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: HashMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_is_scoped_by_game_id() {
        let mut store = MemoryFileStore::new();
        store.write("game-a", "save1", b"aaa");
        store.write("game-b", "save1", b"bbb");
        store.write("game-a", "save2", b"ccc");

        assert_eq!(store.list("game-a"), vec!["save1", "save2"]);
        assert_eq!(store.read("game-a", "save1"), Some(b"aaa".to_vec()));
        assert_eq!(store.read("game-b", "save1"), Some(b"bbb".to_vec()));
        assert!(store.delete("game-a", "save1"));
        assert!(!store.delete("game-a", "save1"));
        assert_eq!(store.list("game-a"), vec!["save2"]);
    }
}
