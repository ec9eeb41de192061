/*!
Fixtures d'inventaire et d'environnement
*/

use anyhow::Result;
use std::io::Write;
use tempfile::NamedTempFile;

/// Inventaire type : groupes imbriqués, hôte déclaré deux fois, groupe vide.
pub const SAMPLE_INVENTORY: &str = r#"
all:
  vars:
    ansible_user: admin
    docker_api_port: 2375
  children:
    docker_hosts:
      vars:
        env: lab
      hosts:
        cyber.lan:
          ansible_host: 10.0.0.5
        forge.lan:
          ansible_host: 10.0.0.6
          docker_api_port: 2376
    ollama_servers:
      hosts:
        gpu-box:
          ansible_host: 10.0.0.9
          ollama_port: 11435
    PiHole:
      hosts:
        dns1:
          ansible_host: 10.0.0.2
          pihole_api_key: secret-one
    nut_servers:
      hosts:
        rack:
          ansible_host: 10.0.0.40
          ups_devices:
            - name: apc
              description: Rack UPS
    infra:
      children:
        core:
          hosts:
            cyber.lan:
              env: prod
    retired:
"#;

/// Écrit `yaml` dans un fichier temporaire ; le fichier vit tant que la valeur vit.
pub fn write_inventory(yaml: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(".yml").tempfile()?;
    file.write_all(yaml.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// `&[("K", "V")]` -> paires possédées, prêtes pour `EnvSnapshot::from_pairs`.
pub fn env_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}
