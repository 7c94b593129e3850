//! CDN Redirector
//!
//! Per-request decision between streaming an artifact directly and
//! redirecting the client to a CDN-hosted mirror. The fallback to direct
//! streaming is silent: the client sees the same contract either way, save
//! for the redirect status itself.

use crate::manifest::ReleaseManifest;

/// How one artifact request should be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Stream bytes from the Release Store.
    Direct,
    /// Send the client to a mirrored copy.
    Redirect(String),
}

pub struct CdnRedirector {
    enabled: bool,
    base_template: Option<String>,
}

impl CdnRedirector {
    /// `base_template` may contain `{version}`, `{platform}` and
    /// `{filename}` placeholders.
    pub fn new(enabled: bool, base_template: Option<String>) -> Self {
        Self {
            enabled,
            base_template,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    pub fn resolve(&self, manifest: &ReleaseManifest) -> Delivery {
        if !self.enabled {
            return Delivery::Direct;
        }

        // Explicit per-manifest mirror wins over the template.
        if let Some(url) = &manifest.cdn_url {
            return Delivery::Redirect(url.clone());
        }

        // Not yet mirrored: serve the bytes ourselves.
        if manifest.mirrored == Some(false) {
            return Delivery::Direct;
        }

        match &self.base_template {
            Some(template) => {
                let filename = manifest
                    .artifact_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(&manifest.artifact_path);
                let url = template
                    .replace("{version}", &manifest.version)
                    .replace("{platform}", manifest.platform.as_str())
                    .replace("{filename}", filename);
                Delivery::Redirect(url)
            }
            None => Delivery::Direct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Platform;
    use chrono::Utc;

    fn manifest() -> ReleaseManifest {
        ReleaseManifest {
            version: "1.3.0".to_string(),
            platform: Platform::LinuxX64,
            artifact_path: "atrium-1.3.0-linux-x64.tar.gz".to_string(),
            checksum: "cafe01".to_string(),
            signature: String::new(),
            published_at: Utc::now(),
            cdn_url: None,
            mirrored: None,
        }
    }

    #[test]
    fn test_disabled_streams_directly() {
        let cdn = CdnRedirector::disabled();
        assert_eq!(cdn.resolve(&manifest()), Delivery::Direct);
    }

    #[test]
    fn test_template_redirect() {
        let cdn = CdnRedirector::new(
            true,
            Some("https://cdn.atrium.app/releases/{version}/{platform}/{filename}".to_string()),
        );
        assert_eq!(
            cdn.resolve(&manifest()),
            Delivery::Redirect(
                "https://cdn.atrium.app/releases/1.3.0/linux-x64/atrium-1.3.0-linux-x64.tar.gz"
                    .to_string()
            )
        );
    }

    #[test]
    fn test_manifest_override_wins() {
        let cdn = CdnRedirector::new(
            true,
            Some("https://cdn.atrium.app/{filename}".to_string()),
        );
        let mut m = manifest();
        m.cdn_url = Some("https://mirror.example.com/atrium.tar.gz".to_string());
        assert_eq!(
            cdn.resolve(&m),
            Delivery::Redirect("https://mirror.example.com/atrium.tar.gz".to_string())
        );
    }

    #[test]
    fn test_unmirrored_falls_back_to_direct() {
        let cdn = CdnRedirector::new(true, Some("https://cdn.atrium.app/{filename}".to_string()));
        let mut m = manifest();
        m.mirrored = Some(false);
        assert_eq!(cdn.resolve(&m), Delivery::Direct);
    }

    #[test]
    fn test_enabled_without_template_or_override() {
        let cdn = CdnRedirector::new(true, None);
        assert_eq!(cdn.resolve(&manifest()), Delivery::Direct);
    }
}
