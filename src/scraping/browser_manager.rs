//! Launching Chrome or Chromium through `chromiumoxide`, and waiting for the
//! client application to mount its render tree after navigation.

use super::cdp::CdpPage;
use super::scripts;
use crate::core::config::chrome_executable_override;
use anyhow::{anyhow, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── User-Agent pool ──────────────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Chromium-family UAs only: the render-tree capture assumes a Chromium page.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Executable names looked up on `PATH`, best first.
const PATH_NAMES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

#[cfg(target_os = "macos")]
const INSTALL_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];
#[cfg(target_os = "linux")]
const INSTALL_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/snap/bin/chromium",
];
#[cfg(target_os = "windows")]
const INSTALL_PATHS: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
];
#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
const INSTALL_PATHS: &[&str] = &[];

/// `CHROME_EXECUTABLE`, then Chrome or Chromium on `PATH`, then the usual
/// install location for this OS.
pub fn find_chrome_executable() -> Option<PathBuf> {
    if let Some(p) = chrome_executable_override() {
        return Some(PathBuf::from(p));
    }
    let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|v| std::env::split_paths(&v).collect())
        .unwrap_or_default();
    first_existing(&path_dirs, PATH_NAMES)
        .or_else(|| INSTALL_PATHS.iter().map(PathBuf::from).find(|p| p.is_file()))
}

fn first_existing(dirs: &[PathBuf], names: &[&str]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

// ── Launch ───────────────────────────────────────────────────────────────────

/// Build a `BrowserConfig`; headless unless `headful` is set.
pub fn build_browser_config(
    exe: &Path,
    headful: bool,
    width: u32,
    height: u32,
) -> Result<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", random_user_agent()));

    if headful {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

/// Launch a browser and drive its CDP handler on a background task.
pub async fn launch_browser(headful: bool) -> Result<(Browser, JoinHandle<()>)> {
    let exe = find_chrome_executable()
        .ok_or_else(|| anyhow!("No Chrome or Chromium found; set CHROME_EXECUTABLE."))?;
    info!(
        "launching {} ({})",
        exe.display(),
        if headful { "headful" } else { "headless" }
    );

    let config = build_browser_config(&exe, headful, 1280, 900)?;
    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| anyhow!("Failed to launch browser ({}): {}", exe.display(), e))?;

    let handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("CDP handler error: {}", e);
            }
        }
    });
    Ok((browser, handle))
}

// ── Page readiness ───────────────────────────────────────────────────────────

/// Poll until the app container carries a mounted render tree, or until
/// `timeout`. Returns whether the tree showed up.
pub async fn wait_for_render_tree(page: &Page, timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        match CdpPage::eval_json::<bool>(page, scripts::render_ready_js()).await {
            Ok(true) => {
                info!("render tree mounted after {}ms", started.elapsed().as_millis());
                return true;
            }
            Ok(false) => {}
            Err(e) => debug!("render-tree check failed: {}", e),
        }
        if started.elapsed() >= timeout {
            warn!("no render tree after {}ms; continuing", timeout.as_millis());
            return false;
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

const READY_POLL: Duration = Duration::from_millis(250);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agents_are_chromium() {
        for _ in 0..16 {
            assert!(random_user_agent().contains("Chrome/"));
        }
    }

    #[test]
    fn test_path_lookup_prefers_earlier_names() {
        let dir = std::env::temp_dir().join(format!("th-browser-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("chromium"), b"").unwrap();
        std::fs::write(dir.join("google-chrome"), b"").unwrap();

        let found = first_existing(&[PathBuf::from("/nonexistent"), dir.clone()], PATH_NAMES);
        assert_eq!(found, Some(dir.join("google-chrome")));
        assert_eq!(first_existing(&[dir.clone()], &["brave"]), None);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
