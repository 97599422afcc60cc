//! Derivation of the emulated device profile.
//!
//! A handful of request-level signals (user agent, accept-language, referer
//! and an optional platform override) are turned into an internally
//! consistent [`EnvironmentProfile`] and [`RefererLocation`]. Derivation never
//! fails: every input has a fallback.

use std::sync::LazyLock;

use regex::Regex;

/// User agent used when none is supplied.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

/// Location used when the referer is missing or unparsable.
pub const DEFAULT_REFERER: &str = "https://www.skland.com/";

/// Language list used when accept-language is missing or empty.
pub const DEFAULT_LANGUAGES: [&str; 2] = ["zh-CN", "zh"];

#[allow(clippy::expect_used)]
static MOBILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("(?i)android|iphone|ipad").expect("static pattern"));

/// Coarse device classification; the single source of truth for geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Phone or tablet.
    Mobile,
    /// Desktop browser.
    Desktop,
}

impl DeviceClass {
    /// Classify a user agent string.
    #[must_use]
    pub fn classify(user_agent: &str) -> Self {
        if MOBILE_PATTERN.is_match(user_agent) {
            Self::Mobile
        } else {
            Self::Desktop
        }
    }

    /// Screen preset for this class.
    #[must_use]
    pub const fn geometry(self) -> ScreenGeometry {
        match self {
            Self::Mobile => ScreenGeometry::MOBILE,
            Self::Desktop => ScreenGeometry::DESKTOP,
        }
    }

    /// Value of `navigator.hardwareConcurrency`.
    #[must_use]
    pub const fn hardware_concurrency(self) -> u32 {
        match self {
            Self::Mobile => 8,
            Self::Desktop => 4,
        }
    }

    /// Value of `navigator.maxTouchPoints`.
    #[must_use]
    pub const fn max_touch_points(self) -> u32 {
        match self {
            Self::Mobile => 5,
            Self::Desktop => 0,
        }
    }
}

/// Screen and window dimensions exposed to the script.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenGeometry {
    /// `screen.width`
    pub screen_width: u32,
    /// `screen.height`
    pub screen_height: u32,
    /// `screen.availWidth`
    pub avail_width: u32,
    /// `screen.availHeight`
    pub avail_height: u32,
    /// `window.devicePixelRatio`
    pub device_pixel_ratio: f64,
    /// `window.innerWidth`
    pub inner_width: u32,
    /// `window.innerHeight`
    pub inner_height: u32,
    /// `window.outerWidth`
    pub outer_width: u32,
    /// `window.outerHeight`
    pub outer_height: u32,
}

impl ScreenGeometry {
    /// Modern phone in portrait orientation.
    pub const MOBILE: Self = Self {
        screen_width: 390,
        screen_height: 844,
        avail_width: 390,
        avail_height: 844,
        device_pixel_ratio: 3.0,
        inner_width: 390,
        inner_height: 844,
        outer_width: 390,
        outer_height: 844,
    };

    /// Full HD desktop with a taskbar and browser chrome.
    pub const DESKTOP: Self = Self {
        screen_width: 1920,
        screen_height: 1080,
        avail_width: 1920,
        avail_height: 1040,
        device_pixel_ratio: 1.0,
        inner_width: 1920,
        inner_height: 969,
        outer_width: 1920,
        outer_height: 1040,
    };
}

/// Raw signals the profile is derived from. `None` means "use the default".
#[derive(Debug, Clone, Default)]
pub struct ProfileInputs {
    /// Browser identity string.
    pub user_agent: Option<String>,
    /// HTTP `Accept-Language` style list.
    pub accept_language: Option<String>,
    /// Page URL the script believes it runs on.
    pub referer: Option<String>,
    /// Forced `navigator.platform`.
    pub platform: Option<String>,
}

/// Device and browser characteristics seeding the global graph.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentProfile {
    /// `navigator.userAgent`
    pub user_agent: String,
    /// Mobile or desktop.
    pub device_class: DeviceClass,
    /// `navigator.platform`
    pub platform: String,
    /// Screen preset chosen by `device_class`.
    pub geometry: ScreenGeometry,
    /// `navigator.languages`; the first entry is `navigator.language`.
    pub languages: Vec<String>,
}

impl EnvironmentProfile {
    /// Derive a profile from the given inputs.
    #[must_use]
    pub fn derive(inputs: &ProfileInputs) -> Self {
        let user_agent = inputs
            .user_agent
            .as_deref()
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .unwrap_or(DEFAULT_USER_AGENT)
            .to_string();
        let device_class = DeviceClass::classify(&user_agent);
        let platform = match inputs.platform.as_deref().filter(|p| !p.is_empty()) {
            Some(platform) => platform.to_string(),
            None => derive_platform(&user_agent).to_string(),
        };

        Self {
            device_class,
            platform,
            geometry: device_class.geometry(),
            languages: parse_languages(inputs.accept_language.as_deref()),
            user_agent,
        }
    }

    /// Primary language (`navigator.language`).
    #[must_use]
    pub fn language(&self) -> &str {
        self.languages
            .first()
            .map_or(DEFAULT_LANGUAGES[0], String::as_str)
    }
}

/// Map a user agent to a `navigator.platform` value. First match wins.
#[must_use]
pub fn derive_platform(user_agent: &str) -> &'static str {
    const RULES: [(&[&str], &str); 4] = [
        (&["Android"], "Linux armv8l"),
        (&["iPhone", "iPad"], "iPhone"),
        (&["Windows"], "Win32"),
        (&["Macintosh", "Mac OS"], "MacIntel"),
    ];

    RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| user_agent.contains(n)))
        .map_or("Linux x86_64", |(_, platform)| platform)
}

/// Parse an accept-language list into bare language tags, keeping order.
#[must_use]
pub fn parse_languages(accept_language: Option<&str>) -> Vec<String> {
    let languages: Vec<String> = accept_language
        .unwrap_or_default()
        .split(',')
        .filter_map(|entry| {
            let tag = entry.split(';').next().unwrap_or_default().trim();
            (!tag.is_empty()).then(|| tag.to_string())
        })
        .collect();

    if languages.is_empty() {
        DEFAULT_LANGUAGES.iter().map(ToString::to_string).collect()
    } else {
        languages
    }
}

/// Components of the page URL, as seen through `location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefererLocation {
    /// Full URL.
    pub href: String,
    /// Scheme with trailing colon, e.g. `https:`.
    pub protocol: String,
    /// Hostname plus non-default port.
    pub host: String,
    /// Hostname only.
    pub hostname: String,
    /// Explicit port, or empty.
    pub port: String,
    /// Path, always starting with `/`.
    pub pathname: String,
    /// Query with leading `?`, or empty.
    pub search: String,
    /// Fragment with leading `#`, or empty.
    pub hash: String,
    /// Scheme, host and port.
    pub origin: String,
}

impl RefererLocation {
    /// Parse `input`, falling back to [`DEFAULT_REFERER`].
    #[must_use]
    pub fn parse(input: Option<&str>) -> Self {
        input
            .map(str::trim)
            .and_then(Self::try_parse)
            .unwrap_or_else(Self::fallback)
    }

    /// [`DEFAULT_REFERER`], already split into its components.
    fn fallback() -> Self {
        const HOST: &str = "www.skland.com";
        Self {
            href: DEFAULT_REFERER.to_string(),
            protocol: "https:".to_string(),
            host: HOST.to_string(),
            hostname: HOST.to_string(),
            port: String::new(),
            pathname: "/".to_string(),
            search: String::new(),
            hash: String::new(),
            origin: format!("https://{HOST}"),
        }
    }

    fn try_parse(input: &str) -> Option<Self> {
        let url = reqwest::Url::parse(input).ok()?;
        let hostname = url.host_str().filter(|h| !h.is_empty())?.to_string();
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let host = if port.is_empty() {
            hostname.clone()
        } else {
            format!("{hostname}:{port}")
        };

        Some(Self {
            href: input.to_string(),
            protocol: format!("{}:", url.scheme()),
            origin: format!("{}://{host}", url.scheme()),
            pathname: url.path().to_string(),
            search: url.query().map(|q| format!("?{q}")).unwrap_or_default(),
            hash: url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
            host,
            hostname,
            port,
        })
    }
}

impl Default for RefererLocation {
    fn default() -> Self {
        Self::parse(None)
    }
}
