use std::path::Path;
use tracing::{debug, info, warn};

use super::tree::{resolve, Inventory, MergePolicy};

pub fn parse_inventory(text: &str, policy: MergePolicy) -> Result<Inventory, serde_yaml::Error> {
    let raw: serde_yaml::Value = serde_yaml::from_str(text)?;
    Ok(resolve(&raw, policy))
}

/// Relit le fichier en entier. Absent ou invalide => inventaire vide, jamais d'erreur :
/// les appelants basculent alors sur la configuration par variables d'environnement.
pub fn load_inventory(path: Option<&Path>, policy: MergePolicy) -> Inventory {
    let Some(path) = path else {
        debug!("no inventory path configured");
        return Inventory::default();
    };

    if !path.exists() {
        info!(path = %path.display(), "inventory file not found, using environment fallback");
        return Inventory::default();
    }

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read inventory");
            return Inventory::default();
        }
    };

    match parse_inventory(&text, policy) {
        Ok(inv) => {
            debug!(path = %path.display(), hosts = inv.hosts.len(), groups = inv.groups.len(), "inventory resolved");
            inv
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed inventory, treating as empty");
            Inventory::default()
        }
    }
}
