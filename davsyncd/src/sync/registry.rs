use std::time::SystemTime;

use davsync_core::RemoteEntry;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::storage::{LocalEntry, LocalRef};

/// Merged view of one file name across the remote collection and local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub name: String,
    pub local_ref: Option<LocalRef>,
    pub local_size: u64,
    pub remote_ref: Option<Url>,
    pub remote_modified: Option<SystemTime>,
    pub remote_size: u64,
    pub remote_content_type: Option<String>,
    pub status: String,
    pub error: bool,
    pub syncing: bool,
}

impl Book {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_ref: None,
            local_size: 0,
            remote_ref: None,
            remote_modified: None,
            remote_size: 0,
            remote_content_type: None,
            status: String::new(),
            error: false,
            syncing: false,
        }
    }

    /// Known remotely, not yet stored locally, and not failed this run.
    pub fn is_pending(&self) -> bool {
        self.remote_ref.is_some() && self.local_ref.is_none() && !self.error
    }

    /// Stored locally with no remote counterpart.
    pub fn is_orphan(&self) -> bool {
        self.remote_ref.is_none() && self.local_ref.is_some()
    }

    pub fn is_detached(&self) -> bool {
        self.remote_ref.is_none() && self.local_ref.is_none()
    }

    fn apply_remote(&mut self, entry: &RemoteEntry) {
        self.remote_ref = Some(entry.href.clone());
        self.remote_modified = entry.modified;
        self.remote_size = entry.size;
        self.remote_content_type = entry.content_type.clone();
    }

    fn apply_local(&mut self, entry: &LocalEntry) {
        self.local_ref = Some(entry.handle.clone());
        self.local_size = entry.size;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Inserted(Book),
    Updated(Book),
    Removed(String),
    Cleared,
}

/// Name-keyed, insertion-ordered set of books.
///
/// Observers never see shared mutable state: every change replaces the stored
/// value, republishes the whole snapshot on a watch channel and sends the
/// changed record to each event subscriber.
pub struct BookRegistry {
    books: Vec<Book>,
    snapshot_tx: watch::Sender<Vec<Book>>,
    subscribers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl Default for BookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BookRegistry {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            books: Vec::new(),
            snapshot_tx,
            subscribers: Vec::new(),
        }
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Book>> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Book> {
        self.books.iter().find(|book| book.name == name)
    }

    pub fn at(&self, index: usize) -> Option<&Book> {
        self.books.get(index)
    }

    pub fn snapshot(&self) -> Vec<Book> {
        self.books.clone()
    }

    pub fn reset_remote(&mut self) {
        self.modify_all(|book| {
            book.remote_ref = None;
            book.remote_modified = None;
            book.remote_size = 0;
            book.remote_content_type = None;
        });
    }

    pub fn reset_local(&mut self) {
        self.modify_all(|book| {
            book.local_ref = None;
            book.local_size = 0;
        });
    }

    pub fn merge_remote(&mut self, entry: &RemoteEntry) {
        self.merge(&entry.name, |book| book.apply_remote(entry));
    }

    pub fn merge_local(&mut self, entry: &LocalEntry) {
        self.merge(&entry.name, |book| book.apply_local(entry));
    }

    /// Drops records that neither side reports any more. Returns how many.
    pub fn prune_detached(&mut self) -> usize {
        let detached: Vec<String> = self
            .books
            .iter()
            .filter(|book| book.is_detached())
            .map(|book| book.name.clone())
            .collect();
        for name in &detached {
            self.remove(name);
        }
        detached.len()
    }

    /// Replaces the stored record with the same name. Returns false when no
    /// such record exists.
    pub fn update(&mut self, book: Book) -> bool {
        let Some(index) = self.position(&book.name) else {
            return false;
        };
        if self.books[index] == book {
            return true;
        }
        self.books[index] = book.clone();
        self.publish(RegistryEvent::Updated(book));
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Book> {
        let index = self.position(name)?;
        let removed = self.books.remove(index);
        self.publish(RegistryEvent::Removed(removed.name.clone()));
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.books.clear();
        self.publish(RegistryEvent::Cleared);
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.books.iter().position(|book| book.name == name)
    }

    fn merge(&mut self, name: &str, apply: impl FnOnce(&mut Book)) {
        if name.is_empty() {
            tracing::warn!("ignoring listing entry with an empty name");
            return;
        }
        match self.position(name) {
            Some(index) => {
                let mut book = self.books[index].clone();
                apply(&mut book);
                if book != self.books[index] {
                    self.books[index] = book.clone();
                    self.publish(RegistryEvent::Updated(book));
                }
            }
            None => {
                let mut book = Book::new(name);
                apply(&mut book);
                self.books.push(book.clone());
                self.publish(RegistryEvent::Inserted(book));
            }
        }
    }

    fn modify_all(&mut self, change: impl Fn(&mut Book)) {
        for index in 0..self.books.len() {
            let mut book = self.books[index].clone();
            change(&mut book);
            if book != self.books[index] {
                self.books[index] = book.clone();
                self.publish(RegistryEvent::Updated(book));
            }
        }
    }

    fn publish(&mut self, event: RegistryEvent) {
        self.snapshot_tx.send_replace(self.books.clone());
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn remote(name: &str, size: u64) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            href: Url::parse(&format!("https://dav.example/books/{name}")).unwrap(),
            display_name: None,
            size,
            content_type: Some("audio/mp4".into()),
            modified: None,
        }
    }

    fn local(name: &str, size: u64) -> LocalEntry {
        LocalEntry {
            name: name.to_string(),
            handle: LocalRef::File(PathBuf::from("/books").join(name)),
            size,
        }
    }

    #[test]
    fn merges_both_sides_into_one_record_per_name() {
        let mut registry = BookRegistry::new();
        registry.merge_remote(&remote("a.m4b", 10));
        registry.merge_remote(&remote("b.m4b", 20));
        registry.merge_local(&local("b.m4b", 20));
        registry.merge_local(&local("c.m4b", 30));
        registry.merge_remote(&remote("a.m4b", 10));

        let books = registry.snapshot();
        let names: Vec<_> = books.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a.m4b", "b.m4b", "c.m4b"]);
        assert!(books.iter().all(|b| !b.is_detached()));

        let b = registry.get("b.m4b").unwrap();
        assert!(b.remote_ref.is_some());
        assert_eq!(b.local_size, 20);
        assert!(registry.get("a.m4b").unwrap().is_pending());
        assert!(registry.get("c.m4b").unwrap().is_orphan());
    }

    #[test]
    fn reset_remote_does_not_resurrect_stale_refs() {
        let mut registry = BookRegistry::new();
        registry.merge_remote(&remote("A", 1));
        registry.merge_remote(&remote("B", 2));

        registry.reset_remote();
        registry.merge_remote(&remote("A", 1));

        let b = registry.get("B").unwrap();
        assert_eq!(b.remote_ref, None);
        assert_eq!(b.remote_size, 0);
        assert!(registry.get("A").unwrap().remote_ref.is_some());

        assert_eq!(registry.prune_detached(), 1);
        assert!(registry.get("B").is_none());
    }

    #[test]
    fn reset_local_keeps_remote_fields() {
        let mut registry = BookRegistry::new();
        registry.merge_remote(&remote("a.m4b", 10));
        registry.merge_local(&local("a.m4b", 10));

        registry.reset_local();

        let book = registry.get("a.m4b").unwrap();
        assert_eq!(book.local_ref, None);
        assert_eq!(book.local_size, 0);
        assert!(book.remote_ref.is_some());
    }

    #[test]
    fn merge_preserves_position_and_transfer_fields() {
        let mut registry = BookRegistry::new();
        registry.merge_remote(&remote("a.m4b", 1));
        registry.merge_remote(&remote("b.m4b", 1));
        let mut failed = registry.get("a.m4b").unwrap().clone();
        failed.error = true;
        failed.status = "boom".into();
        registry.update(failed);

        registry.merge_remote(&remote("a.m4b", 99));

        let book = registry.at(0).unwrap();
        assert_eq!(book.name, "a.m4b");
        assert_eq!(book.remote_size, 99);
        assert!(book.error);
        assert_eq!(book.status, "boom");
    }

    #[test]
    fn remerging_equal_data_publishes_nothing() {
        let mut registry = BookRegistry::new();
        registry.merge_remote(&remote("a.m4b", 1));
        let mut events = registry.subscribe();

        registry.merge_remote(&remote("a.m4b", 1));

        assert!(events.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn publishes_snapshots_and_events() {
        let mut registry = BookRegistry::new();
        let snapshots = registry.watch();
        let mut events = registry.subscribe();

        registry.merge_remote(&remote("a.m4b", 1));
        registry.remove("a.m4b");
        registry.clear();

        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Inserted(b)) if b.name == "a.m4b"));
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::Removed("a.m4b".into()));
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::Cleared);
        assert!(snapshots.borrow().is_empty());
    }

    #[test]
    fn dropped_subscribers_are_forgotten() {
        let mut registry = BookRegistry::new();
        drop(registry.subscribe());
        registry.merge_local(&local("a.m4b", 1));
        assert!(registry.subscribers.is_empty());
    }

    #[test]
    fn update_of_unknown_name_is_rejected() {
        let mut registry = BookRegistry::new();
        assert!(!registry.update(Book::new("ghost.m4b")));
        assert!(registry.is_empty());
    }
}
