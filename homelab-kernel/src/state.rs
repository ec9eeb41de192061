use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Etat mutable partagé entre tâches (maps de sessions, compteurs).
pub type Shared<T> = Arc<Mutex<T>>;

/// Slot remplacé en bloc : les lecteurs clonent l'Arc, jamais le contenu.
pub type Slot<T> = RwLock<Option<Arc<T>>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub fn empty_slot<T>() -> Slot<T> {
    RwLock::new(None)
}
