use serde::{Deserialize, Serialize};

/// Host session identifier (one per connected user)
pub type SessionId = u32;

/// Host channel identifier
pub type ChannelId = u32;

/// HF amateur band, named by approximate wavelength in meters.
///
/// Variants are declared from the lowest to the highest frequency, so the
/// derived ordering matches the band table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Band {
    #[serde(rename = "160m")]
    M160,
    #[serde(rename = "80m")]
    M80,
    #[serde(rename = "60m")]
    M60,
    #[serde(rename = "40m")]
    M40,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "20m")]
    M20,
    #[serde(rename = "17m")]
    M17,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "10m")]
    M10,
    #[serde(rename = "6m")]
    M6,
}

impl Band {
    pub const ALL: [Band; 10] = [
        Band::M160,
        Band::M80,
        Band::M60,
        Band::M40,
        Band::M30,
        Band::M20,
        Band::M17,
        Band::M15,
        Band::M10,
        Band::M6,
    ];

    pub fn meters(&self) -> u16 {
        match self {
            Band::M160 => 160,
            Band::M80 => 80,
            Band::M60 => 60,
            Band::M40 => 40,
            Band::M30 => 30,
            Band::M20 => 20,
            Band::M17 => 17,
            Band::M15 => 15,
            Band::M10 => 10,
            Band::M6 => 6,
        }
    }

    pub fn from_meters(meters: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|band| band.meters() == meters)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::M160 => "160m",
            Band::M80 => "80m",
            Band::M60 => "60m",
            Band::M40 => "40m",
            Band::M30 => "30m",
            Band::M20 => "20m",
            Band::M17 => "17m",
            Band::M15 => "15m",
            Band::M10 => "10m",
            Band::M6 => "6m",
        }
    }

    /// Position in [`Band::ALL`], lowest frequency first
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Band {
    type Err = String;

    /// Accepts "20m", "20M", "20" and " 20 m ".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let digits = cleaned.strip_suffix('m').unwrap_or(&cleaned);

        digits
            .parse::<u16>()
            .ok()
            .and_then(Band::from_meters)
            .ok_or_else(|| format!("Unknown band: {}", s))
    }
}

/// Season used by the MUF model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    #[default]
    Winter,
    Spring,
    Summer,
    Fall,
}

impl Season {
    /// Northern-hemisphere meteorological season for a calendar month (1-12).
    pub fn from_month(month: u32) -> Self {
        match month {
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            9..=11 => Season::Fall,
            _ => Season::Winter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Winter => "winter",
            Season::Spring => "spring",
            Season::Summer => "summer",
            Season::Fall => "fall",
        }
    }
}

impl std::fmt::Display for Season {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "winter" => Ok(Season::Winter),
            "spring" => Ok(Season::Spring),
            "summer" => Ok(Season::Summer),
            "fall" | "autumn" => Ok(Season::Fall),
            _ => Err(format!("Unknown season: {}", s)),
        }
    }
}

/// External data source feeding the propagation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedSource {
    /// Per-band propagation levels
    #[serde(rename = "dxview")]
    DxView,
    /// Solar flux and planetary K-index
    #[serde(rename = "swpc")]
    Swpc,
}

impl FeedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedSource::DxView => "dxview",
            FeedSource::Swpc => "swpc",
        }
    }
}

impl std::fmt::Display for FeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Notifications published by the propagation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PropagationEvent {
    /// Conditions were refreshed and the signal cache invalidated
    PropagationUpdated,
    /// A freshly computed pair strength differs from the last known value
    SignalStrengthChanged {
        grid1: String,
        grid2: String,
        strength: f64,
    },
    /// Maximum usable frequency of the latest computed path changed
    MufChanged { muf: f64 },
    /// Outcome of one external feed attempt
    ExternalDataUpdated { source: FeedSource, success: bool },
}
