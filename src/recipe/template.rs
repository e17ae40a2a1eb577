//! The canonical Python service recipe.
//!
//! Directive order matters for caching: the dependency manifest is copied and
//! installed before the rest of the source so that source-only edits reuse
//! the dependency layer.

/// File name written by `image-builder init`.
pub const RECIPE_FILE: &str = "Containerfile";

pub const PYTHON_BASE_IMAGE: &str = "python:3.11-slim";
pub const APP_DIR: &str = "/app";
pub const MANIFEST_FILE: &str = "requirements.txt";
pub const SERVICE_PORT: u16 = 8000;

/// OS packages for in-container diagnostics: an HTTP client, a raw TCP
/// utility and root certificates.
pub const DIAGNOSTIC_PACKAGES: &[&str] = &["curl", "netcat-traditional", "ca-certificates"];

/// Render the recipe for a Python web service image.
pub fn python_service_recipe() -> String {
    format!(
        "FROM {base}\n\
         \n\
         ENV PYTHONDONTWRITEBYTECODE=1 \\\n    PYTHONUNBUFFERED=1\n\
         \n\
         INSTALL os {packages}\n\
         \n\
         WORKDIR {app}\n\
         \n\
         COPY {manifest} .\n\
         INSTALL pip {manifest}\n\
         \n\
         COPY . .\n\
         \n\
         EXPOSE {port}\n",
        base = PYTHON_BASE_IMAGE,
        packages = DIAGNOSTIC_PACKAGES.join(" "),
        app = APP_DIR,
        manifest = MANIFEST_FILE,
        port = SERVICE_PORT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Directive, PackageList, Recipe};

    #[test]
    fn template_parses_and_keeps_cache_friendly_order() {
        let recipe = Recipe::parse(&python_service_recipe()).unwrap();
        assert_eq!(recipe.base().to_string(), PYTHON_BASE_IMAGE);

        let directives: Vec<_> = recipe.directives().collect();
        let env_at = directives
            .iter()
            .position(|d| matches!(d, Directive::Env(_)))
            .unwrap();
        let os_at = directives
            .iter()
            .position(|d| matches!(d, Directive::Install(PackageList::Os(_))))
            .unwrap();
        let pip_at = directives
            .iter()
            .position(|d| matches!(d, Directive::Install(PackageList::Pip { .. })))
            .unwrap();
        let full_copy_at = directives
            .iter()
            .position(|d| matches!(d, Directive::Copy { sources, .. } if sources == &["."]))
            .unwrap();

        assert!(env_at < os_at);
        assert!(os_at < pip_at);
        assert!(pip_at < full_copy_at);
    }
}
