use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::core::model::Browser;
use crate::plugins::registry::CookieSource;

/// Reads cookies out of a local browser profile.
pub struct BrowserCookies {
    /// Overrides profile discovery, mostly for tests.
    db_override: Option<PathBuf>,
}

impl BrowserCookies {
    pub fn new() -> Self {
        Self { db_override: None }
    }

    #[cfg(test)]
    pub fn with_database(path: PathBuf) -> Self {
        Self { db_override: Some(path) }
    }

    async fn load(&self, browser: Browser, host: &str) -> anyhow::Result<HashMap<String, String>> {
        let db = match &self.db_override {
            Some(p) => p.clone(),
            // Profile discovery walks directories with blocking calls.
            None => tokio::task::spawn_blocking(move || find_cookie_db(browser))
                .await
                .context("cookie database discovery")?
                .with_context(|| format!("no {} cookie database found", browser.name()))?,
        };

        // Browsers keep the database locked while running; read a copy.
        let copy = std::env::temp_dir().join(format!("vf-cookies-{}.sqlite", Uuid::new_v4()));
        tokio::fs::copy(&db, &copy)
            .await
            .with_context(|| format!("copy {} to {}", db.display(), copy.display()))?;
        let wal = sidecar(&db, "-wal");
        let copy_wal = sidecar(&copy, "-wal");
        if tokio::fs::metadata(&wal).await.is_ok() {
            tokio::fs::copy(&wal, &copy_wal).await.ok();
        }

        let result = read_cookies(browser, &copy, host).await;

        let _ = tokio::fs::remove_file(&copy).await;
        let _ = tokio::fs::remove_file(&copy_wal).await;
        let _ = tokio::fs::remove_file(sidecar(&copy, "-shm")).await;
        result
    }
}

#[async_trait]
impl CookieSource for BrowserCookies {
    async fn cookies_for(&self, browser: Option<Browser>, url: &Url) -> HashMap<String, String> {
        let Some(browser) = browser else {
            return HashMap::new();
        };
        let Some(host) = url.host_str() else {
            return HashMap::new();
        };

        match self.load(browser, host).await {
            Ok(cookies) => {
                debug!(browser = browser.name(), host, count = cookies.len(), "loaded browser cookies");
                cookies
            }
            Err(e) => {
                warn!(browser = browser.name(), host, error = %format!("{:#}", e), "could not load browser cookies");
                HashMap::new()
            }
        }
    }
}

fn sidecar(db: &Path, suffix: &str) -> PathBuf {
    let mut s = db.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

async fn read_cookies(browser: Browser, db: &Path, host: &str) -> anyhow::Result<HashMap<String, String>> {
    let opts = SqliteConnectOptions::new().filename(db).read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .with_context(|| format!("open sqlite {}", db.display()))?;

    let sql = match browser {
        Browser::Firefox => "SELECT host, name, value FROM moz_cookies ORDER BY length(host), name",
        Browser::Chrome | Browser::Chromium => {
            "SELECT host_key, name, value FROM cookies ORDER BY length(host_key), name"
        }
    };
    let rows = sqlx::query(sql)
        .fetch_all(&pool)
        .await
        .with_context(|| format!("query cookies from {}", db.display()));
    pool.close().await;

    let mut cookies = HashMap::new();
    let mut encrypted = 0usize;
    for row in rows? {
        let domain: String = row.try_get(0)?;
        let name: String = row.try_get(1)?;
        let value: String = row.try_get(2)?;
        if !domain_matches(host, &domain) {
            continue;
        }
        if value.is_empty() {
            // Chrome keeps the real value in `encrypted_value`.
            encrypted += 1;
            continue;
        }
        // More specific domains sort last and win.
        cookies.insert(name, value);
    }
    if encrypted > 0 {
        debug!(browser = browser.name(), host, skipped = encrypted, "skipped encrypted cookies");
    }
    Ok(cookies)
}

/// Whether a cookie stored for `domain` applies to requests to `host`.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn find_cookie_db(browser: Browser) -> Option<PathBuf> {
    match browser {
        Browser::Firefox => firefox_profiles_dir().and_then(|dir| newest_profile_db(&dir)),
        Browser::Chrome | Browser::Chromium => chrome_user_data_dir(browser).and_then(|dir| {
            [dir.join("Default").join("Network").join("Cookies"), dir.join("Default").join("Cookies")]
                .into_iter()
                .find(|p| p.is_file())
        }),
    }
}

fn firefox_profiles_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        dirs::config_dir().map(|d| d.join("Firefox").join("Profiles"))
    } else if cfg!(windows) {
        dirs::config_dir().map(|d| d.join("Mozilla").join("Firefox").join("Profiles"))
    } else {
        dirs::home_dir().map(|d| d.join(".mozilla").join("firefox"))
    }
}

fn chrome_user_data_dir(browser: Browser) -> Option<PathBuf> {
    let chromium = browser == Browser::Chromium;
    if cfg!(target_os = "macos") {
        dirs::config_dir().map(|d| {
            if chromium {
                d.join("Chromium")
            } else {
                d.join("Google").join("Chrome")
            }
        })
    } else if cfg!(windows) {
        dirs::data_local_dir().map(|d| {
            if chromium {
                d.join("Chromium").join("User Data")
            } else {
                d.join("Google").join("Chrome").join("User Data")
            }
        })
    } else {
        dirs::config_dir().map(|d| d.join(if chromium { "chromium" } else { "google-chrome" }))
    }
}

/// Most recently used `cookies.sqlite` among the profiles under `dir`.
fn newest_profile_db(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path().join("cookies.sqlite"))
        .filter_map(|p| {
            let modified = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, p)| p)
}
