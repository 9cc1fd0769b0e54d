//! Project adoption: scan a directory's compose manifest, elect the primary
//! HTTP service, assign hostnames, and persist the record in the registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::compose::{self, ServiceInfo};
use crate::paths::Paths;
use crate::store::{self, Project};
use crate::validate;

/// Outcome of an adopt operation, for CLI display.
#[derive(Debug)]
pub struct AdoptResult {
    pub project_name: String,
    pub dir: PathBuf,
    pub hostname: String,
    pub http_services: Vec<ServiceInfo>,
    pub skipped_services: Vec<ServiceInfo>,
}

/// Scan `dir` and register it for automatic routing.
///
/// The base hostname defaults to `<dirname>.localhost`; the primary HTTP
/// service receives it bare and every other HTTP service gets a
/// `<service>.` prefix. With `dry_run` the result is returned without
/// touching the registry.
pub fn adopt(paths: &Paths, dir: &Path, hostname: &str, dry_run: bool) -> anyhow::Result<AdoptResult> {
    let abs_dir = std::fs::canonicalize(dir)
        .with_context(|| format!("resolving path {}", dir.display()))?;
    if !abs_dir.is_dir() {
        anyhow::bail!("{} is not a directory", abs_dir.display());
    }

    let project_name = dir_leaf_name(&abs_dir)?;

    let hostname = if hostname.is_empty() {
        format!("{project_name}.localhost")
    } else {
        hostname.to_string()
    };
    validate::hostname(&hostname).context("invalid hostname")?;

    let services = compose::scan(&abs_dir)?;

    // Docker Compose labels containers with the directory name by default.
    let compose_project = project_name.clone();

    let (http_services, skipped_services): (Vec<_>, Vec<_>) =
        services.into_iter().partition(|s| s.is_http);

    if http_services.is_empty() {
        anyhow::bail!("no HTTP services detected in {}", abs_dir.display());
    }

    let assignments = assign_hostnames(&http_services, &hostname);
    for (service, assigned) in &assignments {
        validate::hostname(assigned)
            .with_context(|| format!("invalid hostname for service {service:?}"))?;
    }

    let result = AdoptResult {
        project_name: project_name.clone(),
        dir: abs_dir.clone(),
        hostname: hostname.clone(),
        http_services,
        skipped_services,
    };

    if dry_run {
        return Ok(result);
    }

    store::load_and_modify(paths, |registry| {
        registry.projects.insert(
            project_name,
            Project {
                dir: abs_dir,
                compose_project,
                hostname,
                services: assignments,
            },
        );
        Ok(())
    })
    .context("saving registry")?;

    Ok(result)
}

/// Remove a project from the registry. Unknown projects are an error.
pub fn unadopt(paths: &Paths, dir: &Path) -> anyhow::Result<()> {
    let abs_dir = match std::fs::canonicalize(dir) {
        Ok(p) => p,
        // The directory may already be gone; fall back to the literal path.
        Err(_) => dir.to_path_buf(),
    };
    let project_name = dir_leaf_name(&abs_dir)?;

    store::load_and_modify(paths, |registry| {
        if registry.projects.remove(&project_name).is_none() {
            anyhow::bail!("project {project_name:?} is not adopted");
        }
        Ok(())
    })
}

fn dir_leaf_name(dir: &Path) -> anyhow::Result<String> {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("cannot derive a project name from {}", dir.display()))
}

fn assign_hostnames(services: &[ServiceInfo], base_hostname: &str) -> BTreeMap<String, String> {
    let primary = find_primary(services);
    services
        .iter()
        .enumerate()
        .map(|(i, svc)| {
            let hostname = if i == primary {
                base_hostname.to_string()
            } else {
                format!("{}.{}", svc.name, base_hostname)
            };
            (svc.name.clone(), hostname)
        })
        .collect()
}

/// Which HTTP service gets the base hostname. First rule that matches wins:
/// a known front-server image, then a conventional service name, then a
/// service on port 80, then the first service.
pub fn find_primary(services: &[ServiceInfo]) -> usize {
    const PRIMARY_IMAGES: &[&str] = &["caddy", "nginx", "httpd", "apache"];
    const PRIMARY_NAMES: &[&str] = &["web", "app", "caddy", "nginx"];

    for image in PRIMARY_IMAGES {
        if let Some(i) = services
            .iter()
            .position(|s| compose::extract_image_base(&s.image).contains(image))
        {
            return i;
        }
    }

    for name in PRIMARY_NAMES {
        if let Some(i) = services.iter().position(|s| s.name == *name) {
            return i;
        }
    }

    if let Some(i) = services.iter().position(|s| s.port == "80") {
        return i;
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Registry;

    fn service(name: &str, image: &str, port: &str) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            image: image.to_string(),
            ports: if port.is_empty() { vec![] } else { vec![port.to_string()] },
            is_http: true,
            port: port.to_string(),
        }
    }

    fn test_paths() -> (tempfile::TempDir, Paths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("state"));
        (tmp, paths)
    }

    #[test]
    fn test_find_primary_image_beats_name() {
        // caddy image dominates the "web"-ish name of the other service
        let services = vec![service("api", "node:18", "3000"), service("web", "caddy:2", "80")];
        assert_eq!(find_primary(&services), 1);
    }

    #[test]
    fn test_find_primary_name_beats_port() {
        let services = vec![
            service("web", "node:18", "80"),
            service("api", "node:18", "3000"),
        ];
        assert_eq!(find_primary(&services), 0);

        let services = vec![
            service("api", "node:18", "3000"),
            service("frontend", "node:18", "80"),
        ];
        // No name match; port 80 wins
        assert_eq!(find_primary(&services), 1);
    }

    #[test]
    fn test_find_primary_falls_back_to_first() {
        let services = vec![
            service("one", "custom", "9000"),
            service("two", "custom", "9001"),
        ];
        assert_eq!(find_primary(&services), 0);
    }

    #[test]
    fn test_adopt_single_service_project() {
        let (tmp, paths) = test_paths();
        let project_dir = tmp.path().join("myapp");
        std::fs::create_dir(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("docker-compose.yml"),
            "services:\n  web:\n    image: nginx\n    ports:\n      - \"80:80\"\n",
        )
        .unwrap();

        let result = adopt(&paths, &project_dir, "", false).unwrap();
        assert_eq!(result.project_name, "myapp");
        assert_eq!(result.hostname, "myapp.localhost");

        let registry = Registry::load(&paths).unwrap();
        let project = &registry.projects["myapp"];
        assert_eq!(project.compose_project, "myapp");
        assert_eq!(project.hostname, "myapp.localhost");
        assert_eq!(project.services["web"], "myapp.localhost");
    }

    #[test]
    fn test_adopt_multi_service_primary_by_image() {
        let (tmp, paths) = test_paths();
        let project_dir = tmp.path().join("myapp");
        std::fs::create_dir(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("docker-compose.yml"),
            "services:\n  api:\n    image: node:18\n    ports:\n      - \"3000:3000\"\n  web:\n    image: caddy:2\n    ports:\n      - \"80:80\"\n",
        )
        .unwrap();

        adopt(&paths, &project_dir, "", false).unwrap();

        let registry = Registry::load(&paths).unwrap();
        let project = &registry.projects["myapp"];
        assert_eq!(project.services["web"], "myapp.localhost");
        assert_eq!(project.services["api"], "api.myapp.localhost");
    }

    #[test]
    fn test_adopt_fails_without_http_services() {
        let (tmp, paths) = test_paths();
        let project_dir = tmp.path().join("dataonly");
        std::fs::create_dir(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("docker-compose.yml"),
            "services:\n  db:\n    image: postgres:16\n    ports:\n      - \"5432:5432\"\n",
        )
        .unwrap();

        let err = adopt(&paths, &project_dir, "", false).unwrap_err();
        assert!(err.to_string().contains("no HTTP services detected"));
    }

    #[test]
    fn test_adopt_rejects_invalid_hostname() {
        let (tmp, paths) = test_paths();
        let project_dir = tmp.path().join("myapp");
        std::fs::create_dir(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("docker-compose.yml"),
            "services:\n  web:\n    image: nginx\n",
        )
        .unwrap();

        assert!(adopt(&paths, &project_dir, "bad{host", false).is_err());
    }

    #[test]
    fn test_adopt_dry_run_saves_nothing() {
        let (tmp, paths) = test_paths();
        let project_dir = tmp.path().join("myapp");
        std::fs::create_dir(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("docker-compose.yml"),
            "services:\n  web:\n    image: nginx\n",
        )
        .unwrap();

        let result = adopt(&paths, &project_dir, "", true).unwrap();
        assert_eq!(result.hostname, "myapp.localhost");
        assert!(Registry::load(&paths).unwrap().projects.is_empty());
    }

    #[test]
    fn test_unadopt_unknown_project_errors() {
        let (tmp, paths) = test_paths();
        let project_dir = tmp.path().join("ghost");
        std::fs::create_dir(&project_dir).unwrap();
        let err = unadopt(&paths, &project_dir).unwrap_err();
        assert!(err.to_string().contains("not adopted"));
    }

    #[test]
    fn test_adopt_then_unadopt() {
        let (tmp, paths) = test_paths();
        let project_dir = tmp.path().join("myapp");
        std::fs::create_dir(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("docker-compose.yml"),
            "services:\n  web:\n    image: nginx\n",
        )
        .unwrap();

        adopt(&paths, &project_dir, "", false).unwrap();
        unadopt(&paths, &project_dir).unwrap();
        assert!(Registry::load(&paths).unwrap().projects.is_empty());
    }
}
