//! Browser-like default headers for proxy clients.
//!
//! Each client draws one header set at construction and keeps it for life;
//! a stable fingerprint per exit IP looks more like a real browser than
//! per-request variation would.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::seq::SliceRandom;
use rand::Rng;

const SECONDARY_LANGUAGES: [&str; 13] = [
    "cs", "de", "es", "fr", "it", "ja", "ko", "nl", "pl", "pt", "ru", "tr", "zh",
];

/// Chrome releases roll roughly monthly; sample from a recent window.
const VERSION_BASE: u32 = 120;
const VERSION_SPREAD: u32 = 5;

/// Build one spoofed header set: ~80% Chrome, ~20% Firefox.
pub fn spoofed_headers() -> HeaderMap {
    let mut rng = rand::thread_rng();
    let mut headers = HeaderMap::new();

    let mut accept_language = String::from("en-US,en;q=0.5");
    if rng.gen::<f32>() > 0.3 {
        let secondary = SECONDARY_LANGUAGES
            .choose(&mut rng)
            .copied()
            .unwrap_or("de");
        accept_language = format!("en-US,en;q=0.9,{};q=0.8", secondary);
    }

    let version = VERSION_BASE + rng.gen_range(0..VERSION_SPREAD);

    if rng.gen::<f32>() > 0.8 {
        // firefox
        set(
            &mut headers,
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        );
        set(&mut headers, "accept-language", &accept_language);

        if rng.gen::<f32>() > 0.8 {
            set(&mut headers, "dnt", "1");
        }

        set(&mut headers, "sec-fetch-dest", "document");
        set(&mut headers, "sec-fetch-mode", "navigate");
        set(&mut headers, "sec-fetch-site", "none");
        set(&mut headers, "sec-fetch-user", "?1");
        set(&mut headers, "upgrade-insecure-requests", "1");
        set(
            &mut headers,
            "user-agent",
            &format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:{version}.0) Gecko/20100101 Firefox/{version}.0"
            ),
        );
    } else {
        // chrome
        set(
            &mut headers,
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        );
        set(&mut headers, "accept-language", &accept_language);

        if rng.gen::<f32>() > 0.2 {
            set(&mut headers, "dnt", "1");
        }

        set(
            &mut headers,
            "sec-ch-ua",
            &format!(
                "\"Google Chrome\";v=\"{version}\", \"Not:A-Brand\";v=\"8\", \"Chromium\";v=\"{version}\""
            ),
        );
        set(&mut headers, "sec-ch-ua-mobile", "?0");
        set(&mut headers, "sec-ch-ua-platform", "\"Windows\"");
        set(&mut headers, "sec-fetch-dest", "document");
        set(&mut headers, "sec-fetch-mode", "navigate");
        set(&mut headers, "sec-fetch-site", "none");
        set(&mut headers, "sec-fetch-user", "?1");
        set(&mut headers, "upgrade-insecure-requests", "1");
        set(
            &mut headers,
            "user-agent",
            &format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.0.0 Safari/537.36"
            ),
        );
    }

    headers
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    // All values above are plain ASCII.
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(headers: &HeaderMap, name: &str) -> String {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn test_every_set_looks_like_a_navigation() {
        for _ in 0..50 {
            let headers = spoofed_headers();

            assert!(!header(&headers, "user-agent").is_empty());
            assert!(header(&headers, "accept").starts_with("text/html"));
            assert!(header(&headers, "accept-language").starts_with("en-US,en;"));
            assert_eq!(header(&headers, "sec-fetch-dest"), "document");
            assert_eq!(header(&headers, "sec-fetch-mode"), "navigate");
            assert_eq!(header(&headers, "sec-fetch-site"), "none");
            assert_eq!(header(&headers, "sec-fetch-user"), "?1");
            assert_eq!(header(&headers, "upgrade-insecure-requests"), "1");
        }
    }

    #[test]
    fn test_browser_version_is_in_the_rolling_window() {
        for _ in 0..50 {
            let headers = spoofed_headers();
            let agent = header(&headers, "user-agent");

            let in_window = (VERSION_BASE..VERSION_BASE + VERSION_SPREAD)
                .any(|v| agent.contains(&format!("/{v}.0")));
            assert!(in_window, "unexpected version in {agent}");
        }
    }

    #[test]
    fn test_chrome_sets_client_hints_and_firefox_does_not() {
        for _ in 0..50 {
            let headers = spoofed_headers();
            let agent = header(&headers, "user-agent");

            if agent.contains("Chrome/") {
                assert!(header(&headers, "sec-ch-ua").contains("Google Chrome"));
                assert_eq!(header(&headers, "sec-ch-ua-mobile"), "?0");
                assert_eq!(header(&headers, "sec-ch-ua-platform"), "\"Windows\"");
            } else {
                assert!(agent.contains("Firefox/"));
                assert!(headers.get("sec-ch-ua").is_none());
            }
        }
    }

    #[test]
    fn test_both_browsers_appear_over_many_draws() {
        let mut chrome = 0;
        let mut firefox = 0;
        for _ in 0..300 {
            let agent = header(&spoofed_headers(), "user-agent");
            if agent.contains("Chrome/") {
                chrome += 1;
            } else {
                firefox += 1;
            }
        }

        // ~80/20 split; both arms must show up.
        assert!(chrome > firefox);
        assert!(firefox > 0);
    }
}
