///! Handles operator console commands.
use regex::Regex;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use hfprop_common::{Band, ChannelId, Season, SessionId};

use super::engine::{PropagationEngine, UpdateReport};

static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*/(\S+)\s*(.*)$").unwrap_or_else(|e| panic!("invalid command pattern: {}", e))
});

const HELP: &str = "Commands: /grid <session> <locator>, /drop <session>, /join <session> <channel>, \
/leave <session>, /prop <s1> <s2>, /talk <s1> <s2>, /band <km>, /path <grid1> <grid2>, /sfi <n>, \
/k <n>, /season <name>, /auto on|off, /external on|off, /dxview on|off, /swpc on|off, /interval [minutes], \
/update, /status";

/// One update per day at most
const MAX_INTERVAL_MINUTES: u64 = 24 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

impl CommandResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Command handler bound to one engine
pub struct CommandHandler {
    engine: Arc<PropagationEngine>,
}

impl CommandHandler {
    pub fn new(engine: Arc<PropagationEngine>) -> Self {
        Self { engine }
    }

    /// Handle one input line
    pub async fn handle_line(&self, line: &str) -> CommandResponse {
        match parse_command(line) {
            Some((command, args)) => self.router(&command.to_ascii_lowercase(), &args).await,
            None => CommandResponse::error("Command parse failed, commands start with '/'. Try /help"),
        }
    }

    /// Route commands to appropriate handlers
    async fn router(&self, command: &str, args: &str) -> CommandResponse {
        let result = match command {
            "grid" => self.grid(args).await,
            "drop" => self.drop_user(args).await,
            "join" => self.join(args).await,
            "leave" => self.leave(args).await,
            "prop" => self.prop(args).await,
            "talk" => self.talk(args).await,
            "band" => self.band(args),
            "path" => self.path(args).await,
            "sfi" => self.sfi(args).await,
            "k" => self.k_index(args).await,
            "season" => self.season(args).await,
            "auto" => self.switch(args, Switch::AutoTime).await,
            "external" => self.switch(args, Switch::External).await,
            "dxview" => self.switch(args, Switch::DxView).await,
            "swpc" => self.switch(args, Switch::Swpc).await,
            "interval" => self.interval(args),
            "update" => Ok(describe_update(self.engine.update_propagation().await)),
            "status" => Ok(self.status().await),
            "help" | "h" => Ok(HELP.to_string()),
            _ => Err(format!("Unknown command: /{}", command)),
        };

        match result {
            Ok(message) => CommandResponse::ok(message),
            Err(message) => CommandResponse::error(message),
        }
    }

    async fn grid(&self, args: &str) -> Result<String, String> {
        let (session, grid): (SessionId, String) = two_args(args, "/grid <session> <locator>")?;
        self.engine
            .register_user_grid(session, &grid)
            .await
            .map_err(|e| e.to_string())?;
        let grid = self.engine.user_grid(session).await.unwrap_or(grid);
        Ok(format!("Session {} is at {}", session, grid))
    }

    async fn drop_user(&self, args: &str) -> Result<String, String> {
        let session: SessionId = one_arg(args, "/drop <session>")?;
        self.engine.remove_user(session).await;
        Ok(format!("Session {} removed", session))
    }

    async fn join(&self, args: &str) -> Result<String, String> {
        let (session, channel): (SessionId, ChannelId) = two_args(args, "/join <session> <channel>")?;
        self.engine.set_user_channel(session, channel).await;
        Ok(match self.engine.get_channel_band(channel) {
            Some(band) => format!("Session {} joined channel {} ({})", session, channel, band),
            None => format!("Session {} joined channel {}", session, channel),
        })
    }

    async fn leave(&self, args: &str) -> Result<String, String> {
        let session: SessionId = one_arg(args, "/leave <session>")?;
        self.engine.clear_user_channel(session).await;
        Ok(format!("Session {} left its channel", session))
    }

    async fn prop(&self, args: &str) -> Result<String, String> {
        let (s1, s2): (SessionId, SessionId) = two_args(args, "/prop <s1> <s2>")?;
        let strength = self.engine.calculate_propagation(s1, s2).await;
        Ok(format!("Signal strength {} <-> {}: {:.3}", s1, s2, strength))
    }

    async fn talk(&self, args: &str) -> Result<String, String> {
        let (s1, s2): (SessionId, SessionId) = two_args(args, "/talk <s1> <s2>")?;
        let verdict = if self.engine.can_communicate(s1, s2).await {
            "can"
        } else {
            "cannot"
        };
        Ok(format!("Sessions {} and {} {} communicate", s1, s2, verdict))
    }

    fn band(&self, args: &str) -> Result<String, String> {
        let distance: f64 = one_arg(args, "/band <km>")?;
        if !distance.is_finite() || distance < 0.0 {
            return Err(format!("Invalid distance: {}", args.trim()));
        }
        let band = self.engine.recommend_band(distance);
        Ok(match self.engine.get_band_channel(band) {
            Some(channel) => format!("{:.0} km: {} (channel {})", distance, band, channel),
            None => format!("{:.0} km: {}", distance, band),
        })
    }

    async fn path(&self, args: &str) -> Result<String, String> {
        let (grid1, grid2): (String, String) = two_args(args, "/path <grid1> <grid2>")?;
        let report = self
            .engine
            .evaluate_grids(&grid1, &grid2)
            .await
            .map_err(|e| e.to_string())?;

        let mut message = format!(
            "{} -> {}: {:.0} km, {}, daylight {:.0}%, MUF {:.1} MHz, LUF {:.1} MHz, strength {:.3}",
            grid1,
            grid2,
            report.distance_km,
            report.band,
            report.day_fraction * 100.0,
            report.muf_mhz,
            report.luf_mhz,
            report.strength
        );
        if !report.usable {
            message.push_str(" (band outside LUF-MUF window)");
        }
        Ok(message)
    }

    async fn sfi(&self, args: &str) -> Result<String, String> {
        let sfi: i64 = one_arg(args, "/sfi <60-300>")?;
        self.engine.set_solar_flux_index(sfi).await;
        let state = self.engine.state().await;
        Ok(format!("Solar flux index is {}", state.solar_flux_index))
    }

    async fn k_index(&self, args: &str) -> Result<String, String> {
        let k_index: i64 = one_arg(args, "/k <0-9>")?;
        self.engine.set_k_index(k_index).await;
        let state = self.engine.state().await;
        Ok(format!("K-index is {}", state.k_index))
    }

    async fn season(&self, args: &str) -> Result<String, String> {
        let season: Season = one_arg(args, "/season winter|spring|summer|fall")?;
        let report = self.engine.set_season(season).await;
        if report.season != season {
            Ok(format!("Season is {} (auto time overrides {}, use /auto off)", report.season, season))
        } else {
            Ok(format!("Season is {}", report.season))
        }
    }

    fn interval(&self, args: &str) -> Result<String, String> {
        if args.trim().is_empty() {
            return Ok(format!("Update interval is {} minutes", self.engine.update_interval_minutes()));
        }
        let minutes: u64 = one_arg(args, "/interval <1-1440>")?;
        if !(1..=MAX_INTERVAL_MINUTES).contains(&minutes) {
            return Err("Usage: /interval <1-1440>".to_string());
        }
        let minutes = self.engine.set_update_interval(minutes);
        Ok(format!("Update interval is {} minutes", minutes))
    }

    async fn switch(&self, args: &str, switch: Switch) -> Result<String, String> {
        let enabled = parse_switch(args).ok_or_else(|| format!("Usage: /{} on|off", switch.command()))?;
        let report = match switch {
            Switch::AutoTime => self.engine.set_auto_time(enabled).await,
            Switch::External => self.engine.set_use_external_data(enabled).await,
            Switch::DxView => self.engine.set_use_dxview_data(enabled).await,
            Switch::Swpc => self.engine.set_use_swpc_data(enabled).await,
        };
        Ok(format!(
            "{} {}; {}",
            switch.label(),
            if enabled { "enabled" } else { "disabled" },
            describe_update(report)
        ))
    }

    async fn status(&self) -> String {
        let state = self.engine.state().await;
        let mut message = String::new();

        let _ = write!(
            message,
            "SFI {}, K {}, season {}{}, external data {} (dxview {}, swpc {})",
            state.solar_flux_index,
            state.k_index,
            state.season,
            if state.auto_time_enabled { " (auto)" } else { "" },
            on_off(state.use_external_data),
            on_off(state.use_dxview_data),
            on_off(state.use_swpc_data),
        );
        if let Some(last) = state.last_external_update {
            let _ = write!(message, ", last fetch {}", last.format("%Y-%m-%d %H:%M UTC"));
        }
        if !state.band_modifiers.is_empty() {
            let mut bands: Vec<Band> = state.band_modifiers.keys().copied().collect();
            bands.sort();
            let list: Vec<String> = bands
                .iter()
                .map(|band| {
                    let m = state.band_modifiers[band];
                    format!("{} {:.1}/{:.1}", band, m.day, m.night)
                })
                .collect();
            let _ = write!(message, ", band conditions: {}", list.join(", "));
        }
        let _ = write!(
            message,
            "; {} users, {} cached pairs",
            self.engine.user_count().await,
            self.engine.cached_pairs().await
        );
        message
    }
}

#[derive(Debug, Clone, Copy)]
enum Switch {
    AutoTime,
    External,
    DxView,
    Swpc,
}

impl Switch {
    fn command(&self) -> &'static str {
        match self {
            Switch::AutoTime => "auto",
            Switch::External => "external",
            Switch::DxView => "dxview",
            Switch::Swpc => "swpc",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Switch::AutoTime => "Auto time",
            Switch::External => "External data",
            Switch::DxView => "Band conditions feed",
            Switch::Swpc => "Solar weather feed",
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn describe_update(report: UpdateReport) -> String {
    if report.feeds_started.is_empty() {
        format!("propagation updated (season {})", report.season)
    } else {
        let feeds: Vec<&str> = report.feeds_started.iter().map(|feed| feed.as_str()).collect();
        format!(
            "propagation updated (season {}), fetching {}",
            report.season,
            feeds.join(", ")
        )
    }
}

/// Parse command from message content
fn parse_command(content: &str) -> Option<(String, String)> {
    let caps = COMMAND_RE.captures(content)?;
    let command = caps.get(1).map_or("", |m| m.as_str()).to_string();
    let args = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
    Some((command, args))
}

fn parse_switch(args: &str) -> Option<bool> {
    match args.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn one_arg<T: FromStr>(args: &str, usage: &str) -> Result<T, String> {
    let mut parts = args.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(value), None) => value.parse().map_err(|_| format!("Usage: {}", usage)),
        _ => Err(format!("Usage: {}", usage)),
    }
}

fn two_args<A: FromStr, B: FromStr>(args: &str, usage: &str) -> Result<(A, B), String> {
    let mut parts = args.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => {
            let a = a.parse().map_err(|_| format!("Usage: {}", usage))?;
            let b = b.parse().map_err(|_| format!("Usage: {}", usage))?;
            Ok((a, b))
        }
        _ => Err(format!("Usage: {}", usage)),
    }
}
