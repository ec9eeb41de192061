/**
 * INVENTAIRE ANSIBLE - parcours de l'arbre, index de recherche, chargement du fichier
 */

mod index;
mod loader;
mod tree;

pub use index::{normalize, InventorySummary};
pub use loader::{load_inventory, parse_inventory};
pub use tree::{resolve, Inventory, MergePolicy};
