/**
 * HOMELAB KERNEL - résolution d'inventaire et outils de supervision en lecture seule
 *
 * FONCTIONNEMENT :
 * - L'inventaire Ansible est résolu en un modèle plat hôtes/groupes
 * - Chaque domaine (docker, ollama, pihole, ping, ups, unifi) en tire ses endpoints
 * - Les sous-serveurs répondent aux appels d'outils par du texte
 */

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod endpoints;
pub mod env;
pub mod errors;
pub mod health;
pub mod http;
pub mod inventory;
pub mod models;
pub mod remote;
pub mod servers;
pub mod session;
pub mod state;

pub use dispatch::Dispatcher;
pub use errors::HomelabError;
pub use inventory::{normalize, Inventory, MergePolicy};
