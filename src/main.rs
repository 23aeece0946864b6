use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// StationCast engine
//
// Single-binary playout engine for an unattended TV box:
//   - Scan a media library (show folders + a commercials pool)
//   - Generate a shuffled, commercial-interleaved broadcast order
//   - Drive an external player through that order forever on a background thread
//   - Serve a programming-guide dashboard reconstructed from persisted state
//
// The player thread and the HTTP side share no memory. They coordinate only
// through three JSON files (schedule, playhead snapshot, duration cache),
// each written to a temp file and renamed into place so a reader never
// observes a partial write.

use anyhow::Context;
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::System;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, Time};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// How many upcoming items the duration prober resolves per transition.
const PROBE_LOOKAHEAD: usize = 5;
/// How many items the guide shows, counting the one on air.
const GUIDE_ITEMS: usize = 10;
/// Guide scale: one pixel-unit of segment width per this many seconds.
const SECONDS_PER_PX: f64 = 6.0;
/// Reserved top-level folder holding the commercial pool.
const COMMERCIALS_DIR: &str = "commercials";

// --- Configuration --------------------------------------------------------
//
// Everything is an env var with a hard default, so a bare systemd unit (or a
// shell) can run the engine without a config file.

fn media_root() -> PathBuf {
    std::env::var("STATIONCAST_MEDIA_ROOT")
        .unwrap_or_else(|_| "/mnt/tvdrive/tv".to_string())
        .into()
}

fn data_dir() -> PathBuf {
    std::env::var("STATIONCAST_DATA_DIR")
        .unwrap_or_else(|_| "/opt/stationcast/shared".to_string())
        .into()
}

// --- Persisted state stores -----------------------------------------------
//
// One flat JSON file per shared resource. The player thread is the only
// writer of the snapshot and duration files; the HTTP side only reads. A
// read either yields the full value or an explicit reason it could not,
// which callers map to retries (player) or placeholders (dashboard).

#[derive(Debug)]
enum StoreRead<T> {
    Available(T),
    Unavailable(String),
}

struct JsonStore<T> {
    path: PathBuf,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonStore<T> {
    fn new(path: PathBuf) -> Self {
        Self { path, _kind: PhantomData }
    }

    fn read(&self) -> StoreRead<T> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => return StoreRead::Unavailable(format!("read {}: {e}", self.path.display())),
        };
        match serde_json::from_str(&raw) {
            Ok(value) => StoreRead::Available(value),
            Err(e) => StoreRead::Unavailable(format!("parse {}: {e}", self.path.display())),
        }
    }

    /// Serialize the full value next to the target file, then rename over it.
    /// Rename is atomic on the same filesystem, so a concurrent reader sees
    /// either the old or the new content, never a torn file.
    fn write(&self, value: &T) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_string(value)?;
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} into place", self.path.display()))?;
        Ok(())
    }
}

/// The three files both halves of the engine coordinate through.
#[derive(Clone)]
struct Stores {
    schedule: Arc<JsonStore<Vec<String>>>,
    playhead: Arc<JsonStore<PlayheadSnapshot>>,
    durations: Arc<JsonStore<DurationMap>>,
}

impl Stores {
    fn in_dir(dir: &Path) -> Self {
        Self {
            schedule: Arc::new(JsonStore::new(dir.join("schedule.json"))),
            playhead: Arc::new(JsonStore::new(dir.join("current.json"))),
            durations: Arc::new(JsonStore::new(dir.join("durations.json"))),
        }
    }
}

/// What is on air right now. Replaced wholesale once per item transition,
/// immediately before the player launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlayheadSnapshot {
    now: String,
    upnext: String,
    show: String,
    start_time: String,
}

impl PlayheadSnapshot {
    /// What the raw status API reports when the snapshot is unreadable.
    fn placeholder() -> Self {
        Self {
            now: "Unknown".into(),
            upnext: "Unknown".into(),
            show: "Unknown".into(),
            start_time: String::new(),
        }
    }

    /// What the guide shows before the broadcast thread has published its
    /// first snapshot.
    fn loading() -> Self {
        Self {
            now: "Loading...".into(),
            upnext: "Loading...".into(),
            show: "Unknown".into(),
            start_time: String::new(),
        }
    }
}

type DurationMap = BTreeMap<String, f64>;

// --- Media library scan ---------------------------------------------------

const PLAYABLE_EXTS: &[&str] = &["mp4", "avi", "mkv", "m4v", "mov"];

#[derive(Debug, Default)]
struct Catalog {
    /// (show folder name, episode path), flattened across all shows.
    episodes: Vec<(String, PathBuf)>,
    commercials: Vec<PathBuf>,
}

fn is_playable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PLAYABLE_EXTS.iter().any(|a| e.eq_ignore_ascii_case(a)))
        .unwrap_or(false)
}

fn list_playable(dir: &Path) -> Vec<PathBuf> {
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) => {
            warn!("failed to read {}: {e}", dir.display());
            return Vec::new();
        }
    };
    let mut out: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_playable(p))
        .collect();
    // read_dir order is filesystem-dependent; sort so scans are reproducible.
    out.sort();
    out
}

/// Walk the media root: every first-level directory is a show, except the
/// reserved commercials pool. Missing or unreadable directories degrade to
/// empty sets so a detached drive cannot kill startup.
fn scan_library(root: &Path) -> Catalog {
    let mut catalog = Catalog::default();
    let rd = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) => {
            warn!("media root {} not readable: {e}", root.display());
            return catalog;
        }
    };
    let mut shows: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    shows.sort();
    for dir in shows {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name.eq_ignore_ascii_case(COMMERCIALS_DIR) {
            catalog.commercials = list_playable(&dir);
            continue;
        }
        for file in list_playable(&dir) {
            catalog.episodes.push((name.clone(), file));
        }
    }
    info!(
        "library scan: {} episodes, {} commercials",
        catalog.episodes.len(),
        catalog.commercials.len()
    );
    catalog
}

// --- Schedule generation --------------------------------------------------

/// Uniformly shuffle all episodes, then slot one randomly drawn commercial
/// after each episode (the pool is global; a commercial may repeat). With no
/// commercials the order is just the shuffled episodes. An empty catalog
/// yields an empty order; the player idles on it instead of failing.
fn build_schedule(catalog: &Catalog) -> Vec<String> {
    let mut episodes: Vec<String> = catalog
        .episodes
        .iter()
        .map(|(_, path)| path.to_string_lossy().to_string())
        .collect();
    fastrand::shuffle(&mut episodes);
    if catalog.commercials.is_empty() {
        return episodes;
    }
    let mut order = Vec::with_capacity(episodes.len() * 2);
    for episode in episodes {
        order.push(episode);
        let pick = &catalog.commercials[fastrand::usize(..catalog.commercials.len())];
        order.push(pick.to_string_lossy().to_string());
    }
    order
}

// --- External commands (player / duration probe) ---------------------------
//
// Both externals are plain synchronous child processes. The trait keeps the
// broadcast loop and the duration cache testable without a real player or
// ffprobe on the box.

trait MediaCommands: Send + Sync {
    /// Run the item to completion. Exit status is ignored: a crashed or
    /// killed player counts as finished, and the schedule advances.
    fn play(&self, path: &str);

    /// Resolve a media file's running time in seconds, or None if the probe
    /// fails or emits something that is not a positive number.
    fn probe_duration(&self, path: &str) -> Option<f64>;
}

struct HostCommands {
    player: String,
    ffprobe: String,
}

impl HostCommands {
    fn from_env() -> Self {
        Self {
            player: std::env::var("STATIONCAST_PLAYER").unwrap_or_else(|_| "cvlc".to_string()),
            ffprobe: std::env::var("STATIONCAST_FFPROBE")
                .unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }
}

impl MediaCommands for HostCommands {
    fn play(&self, path: &str) {
        let status = std::process::Command::new(&self.player)
            .arg("--aspect-ratio=16:9")
            .arg("--aout")
            .arg("alsa")
            .arg("--fullscreen")
            .arg("--play-and-exit")
            .arg(path)
            .status();
        match status {
            Ok(st) if !st.success() => warn!("player exited with {st} for {path}"),
            Ok(_) => {}
            Err(e) => warn!("failed to launch player for {path}: {e}"),
        }
    }

    fn probe_duration(&self, path: &str) -> Option<f64> {
        let out = std::process::Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path)
            .output()
            .ok()?;

        if !out.status.success() {
            return None;
        }

        let s = String::from_utf8_lossy(&out.stdout);
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        let secs: f64 = s.parse().ok()?;
        if !secs.is_finite() || secs <= 0.0 {
            return None;
        }
        Some(secs)
    }
}

// --- Duration cache -------------------------------------------------------

/// Resolve running times for the next few items after `cursor`, skipping
/// anything already cached. The window wraps because playback does. Cost is
/// bounded by PROBE_LOOKAHEAD probe invocations, so calling this once per
/// item transition cannot stall the broadcast. A failed probe leaves the key
/// absent; it is retried the next time it falls inside the window.
fn refresh_durations(
    store: &JsonStore<DurationMap>,
    commands: &dyn MediaCommands,
    order: &[String],
    cursor: usize,
) {
    if order.is_empty() {
        return;
    }
    let mut cache = match store.read() {
        StoreRead::Available(map) => map,
        StoreRead::Unavailable(reason) => {
            debug!("starting a fresh duration cache: {reason}");
            DurationMap::new()
        }
    };
    let mut added = false;
    let mut visited = HashSet::new();
    for step in 1..=PROBE_LOOKAHEAD {
        let idx = (cursor + step) % order.len();
        if !visited.insert(idx) {
            break;
        }
        let path = &order[idx];
        let name = display_name(path);
        if cache.contains_key(&name) {
            continue;
        }
        match commands.probe_duration(path) {
            Some(secs) => {
                debug!("probed {name}: {secs:.1}s");
                cache.insert(name, secs);
                added = true;
            }
            None => warn!("duration probe failed for {name}; will retry later"),
        }
    }
    if added {
        if let Err(e) = store.write(&cache) {
            warn!("failed to persist duration cache: {e:#}");
        }
    }
}

// --- Title presentation ---------------------------------------------------

/// Release-tag tokens stripped from file titles, matched case-insensitively
/// on whole tokens after separator collapse.
const RELEASE_TAGS: &[&str] = &[
    "480p", "576p", "720p", "1080p", "1080i", "2160p", "4k", "uhd", "hdr", "hdr10", "10bit",
    "8bit", "x264", "x265", "h264", "h265", "hevc", "avc", "av1", "xvid", "divx", "bluray",
    "brrip", "bdrip", "dvdrip", "dvd", "webrip", "webdl", "web", "dl", "hdtv", "pdtv", "remux",
    "aac", "ac3", "eac3", "dts", "truehd", "atmos", "proper", "repack", "internal", "limited",
    "extended", "unrated", "remastered", "group", "rarbg", "yify", "yts", "ettv", "eztv", "amzn",
    "nf", "dsnp",
];

/// File name as persisted in the snapshot and duration cache: the basename
/// with its extension. Two shows carrying an identically named file are
/// indistinguishable at this level; that ambiguity is inherited from the
/// on-disk state format.
fn display_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string()
}

fn show_name(path: &str) -> String {
    Path::new(path)
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("Unknown")
        .to_string()
}

/// Turn a raw file name into a guide label: drop the extension, collapse
/// separator runs, strip a leading repetition of the show name, drop release
/// tags, and trim the edges. Always prefixed with the show name.
fn format_title(show: &str, name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let spaced: String = stem
        .chars()
        .map(|c| match c {
            '.' | '_' | '-' | '(' | ')' | '[' | ']' | '{' | '}' => ' ',
            c => c,
        })
        .collect();
    let mut tokens: Vec<&str> = spaced.split_whitespace().collect();
    let show_tokens: Vec<&str> = show.split_whitespace().collect();
    if !show_tokens.is_empty()
        && tokens.len() >= show_tokens.len()
        && tokens[..show_tokens.len()]
            .iter()
            .zip(&show_tokens)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    {
        tokens.drain(..show_tokens.len());
    }
    tokens.retain(|t| !RELEASE_TAGS.iter().any(|tag| t.eq_ignore_ascii_case(tag)));
    let cleaned = tokens.join(" ");
    let cleaned = cleaned.trim_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation());
    let title = if cleaned.is_empty() { spaced.trim() } else { cleaned };
    if title.is_empty() {
        return format!("{show} - {name}");
    }
    format!("{show} - {title}")
}

// --- Broadcast loop -------------------------------------------------------

fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn local_timestamp() -> String {
    local_now().format(&Rfc3339).unwrap_or_default()
}

/// Drives playback forever on a dedicated OS thread. Each pass re-reads the
/// persisted order, so a restart resumes from the same generated schedule.
/// An unreadable schedule (mid-write, corrupt) is retried instead of killing
/// the thread; a dead broadcast thread costs air time.
fn run_player(stores: Stores, commands: Arc<dyn MediaCommands>) {
    loop {
        let order = match stores.schedule.read() {
            StoreRead::Available(order) => order,
            StoreRead::Unavailable(reason) => {
                warn!("schedule unavailable, retrying: {reason}");
                std::thread::sleep(std::time::Duration::from_secs(3));
                continue;
            }
        };
        if order.is_empty() {
            warn!("schedule is empty; nothing to broadcast");
            std::thread::sleep(std::time::Duration::from_secs(30));
            continue;
        }
        broadcast_pass(&order, &stores, commands.as_ref());
    }
}

/// One full pass over the order. On entering slot i: publish the snapshot
/// (up-next wraps past the last index, the order is cyclic), resolve the
/// duration lookahead, then block on the player until the item ends.
fn broadcast_pass(order: &[String], stores: &Stores, commands: &dyn MediaCommands) {
    if order.is_empty() {
        return;
    }
    for (i, path) in order.iter().enumerate() {
        let snap = PlayheadSnapshot {
            now: display_name(path),
            show: show_name(path),
            upnext: display_name(&order[(i + 1) % order.len()]),
            start_time: local_timestamp(),
        };
        info!("on air [{i}]: {} ({})", snap.now, snap.show);
        if let Err(e) = stores.playhead.write(&snap) {
            warn!("failed to publish playhead snapshot: {e:#}");
        }
        refresh_durations(&stores.durations, commands, order, i);
        commands.play(path);
    }
}

// --- Programming guide ----------------------------------------------------
//
// Reconstructed per request from the persisted files alone; nothing here
// talks to the broadcast thread. Pure: same (order, snapshot, durations,
// now) in, same model out.

#[derive(Debug, Clone, PartialEq, Serialize)]
struct GuideSegment {
    label: String,
    /// One pixel-unit per SECONDS_PER_PX seconds of running time.
    width_px: u32,
    /// Share of the reconstructed timeline, 0..100.
    pct: f64,
    /// True for the item on air.
    now: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct HourTick {
    label: String,
    pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct GuideModel {
    now: String,
    show: String,
    upnext: String,
    clock: String,
    /// H:MM:SS until the current item ends, "starting soon" once past its
    /// end, or None while its duration is still unresolved.
    countdown: Option<String>,
    segments: Vec<GuideSegment>,
    hour_ticks: Vec<HourTick>,
    cursor_pct: f64,
    /// Upcoming items whose duration is unknown; they carry no width, so
    /// they are listed instead of drawn.
    up_later: Vec<String>,
}

fn format_hms(total: i64) -> String {
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h}:{m:02}:{s:02}")
}

fn build_guide(
    order: &[String],
    snap: &PlayheadSnapshot,
    durations: &DurationMap,
    now: OffsetDateTime,
) -> GuideModel {
    let clock_fmt = format_description!("[hour repr:12 padding:none]:[minute] [period]");
    let clock = now.format(&clock_fmt).unwrap_or_default();

    if order.is_empty() {
        return GuideModel {
            now: snap.now.clone(),
            show: snap.show.clone(),
            upnext: snap.upnext.clone(),
            clock,
            countdown: None,
            segments: Vec::new(),
            hour_ticks: Vec::new(),
            cursor_pct: 0.0,
            up_later: Vec::new(),
        };
    }

    // The snapshot names the current item; a stale or colliding name simply
    // lands the guide on index 0.
    let idx = order
        .iter()
        .position(|p| display_name(p) == snap.now)
        .unwrap_or(0);
    let lookahead: Vec<&str> = (0..order.len().min(GUIDE_ITEMS))
        .map(|j| order[(idx + j) % order.len()].as_str())
        .collect();

    let start = OffsetDateTime::parse(&snap.start_time, &Rfc3339).unwrap_or(now);

    let mut known: Vec<(String, f64, bool)> = Vec::new();
    let mut up_later = Vec::new();
    let mut total = 0.0_f64;
    for (j, path) in lookahead.iter().enumerate() {
        let name = display_name(path);
        let label = format_title(&show_name(path), &name);
        match durations.get(&name) {
            Some(&d) if d.is_finite() && d > 0.0 => {
                known.push((label, d, j == 0));
                total += d;
            }
            _ => up_later.push(label),
        }
    }

    let segments = known
        .into_iter()
        .map(|(label, d, is_now)| GuideSegment {
            label: format!("{label} ({} min)", (d / 60.0).round() as i64),
            width_px: (d / SECONDS_PER_PX).round() as u32,
            pct: if total > 0.0 { d / total * 100.0 } else { 0.0 },
            now: is_now,
        })
        .collect();

    let mut hour_ticks = Vec::new();
    if total > 0.0 {
        let hour_fmt = format_description!("[hour repr:12 padding:none] [period]");
        let end = start + time::Duration::seconds_f64(total);
        let top = Time::from_hms(start.hour(), 0, 0).unwrap_or(Time::MIDNIGHT);
        let mut tick = start.replace_time(top);
        while tick < start {
            tick += time::Duration::HOUR;
        }
        while tick <= end {
            hour_ticks.push(HourTick {
                label: tick.format(&hour_fmt).unwrap_or_default(),
                pct: (tick - start).as_seconds_f64() / total * 100.0,
            });
            tick += time::Duration::HOUR;
        }
    }

    let cursor_pct = if total > 0.0 {
        ((now - start).as_seconds_f64() / total * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let countdown = durations
        .get(&display_name(lookahead[0]))
        .filter(|d| d.is_finite() && **d > 0.0)
        .map(|&d| {
            let end = start + time::Duration::seconds_f64(d);
            let left = (end - now).whole_seconds();
            if left <= 0 {
                "starting soon".to_string()
            } else {
                format_hms(left)
            }
        });

    let current = lookahead[0];
    let next = lookahead.get(1).copied().unwrap_or(current);
    GuideModel {
        now: format_title(&show_name(current), &display_name(current)),
        show: show_name(current),
        upnext: format_title(&show_name(next), &display_name(next)),
        clock,
        countdown,
        segments,
        hour_ticks,
        cursor_pct,
        up_later,
    }
}

/// Assemble the guide from whatever state is readable right now. Unreadable
/// files degrade to placeholders; the dashboard never surfaces an error.
fn current_guide(stores: &Stores) -> GuideModel {
    let order = match stores.schedule.read() {
        StoreRead::Available(order) => order,
        StoreRead::Unavailable(reason) => {
            debug!("schedule unavailable for guide: {reason}");
            Vec::new()
        }
    };
    let snap = match stores.playhead.read() {
        StoreRead::Available(snap) => snap,
        StoreRead::Unavailable(reason) => {
            debug!("playhead unavailable for guide: {reason}");
            PlayheadSnapshot::loading()
        }
    };
    let durations = match stores.durations.read() {
        StoreRead::Available(map) => map,
        StoreRead::Unavailable(reason) => {
            debug!("duration cache unavailable for guide: {reason}");
            DurationMap::new()
        }
    };
    build_guide(&order, &snap, &durations, local_now())
}

// --- HTTP API -------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    version: String,
    sys: Arc<tokio::sync::Mutex<System>>,
    stores: Stores,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(api_status))
        .route("/api/v1/guide", get(api_guide))
        .route("/api/v1/schedule", get(api_schedule))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/system/info", get(system_info))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Raw playhead snapshot, exactly as the broadcast thread persisted it.
async fn api_status(State(state): State<AppState>) -> Json<PlayheadSnapshot> {
    match state.stores.playhead.read() {
        StoreRead::Available(snap) => Json(snap),
        StoreRead::Unavailable(reason) => {
            debug!("playhead unavailable for status: {reason}");
            Json(PlayheadSnapshot::placeholder())
        }
    }
}

async fn api_guide(State(state): State<AppState>) -> Json<GuideModel> {
    Json(current_guide(&state.stores))
}

/// The full broadcast order as guide labels, in airing sequence.
async fn api_schedule(State(state): State<AppState>) -> Json<Vec<String>> {
    let labels = match state.stores.schedule.read() {
        StoreRead::Available(order) => order
            .iter()
            .map(|p| format_title(&show_name(p), &display_name(p)))
            .collect(),
        StoreRead::Unavailable(reason) => {
            debug!("schedule unavailable for listing: {reason}");
            Vec::new()
        }
    };
    Json(labels)
}

async fn ping(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "version": state.version,
        "features": ["status", "guide", "schedule"]
    }))
}

#[derive(Clone, Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    arch: String,
    cpu_model: String,
    cpu_cores: usize,
    load_1m: f32,
    load_5m: f32,
    load_15m: f32,
    temp_c: Option<f32>,
    hostname: Option<String>,
}

async fn system_info(State(st): State<AppState>) -> Json<SystemInfo> {
    let arch = std::env::consts::ARCH.to_string();
    let hostname = sysinfo::System::host_name();

    let mut sys = st.sys.lock().await;
    sys.refresh_all();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "Unknown CPU".to_string());
    let cpu_cores = sys.cpus().len();

    let la = sysinfo::System::load_average();
    let temp_c = read_temp_c();

    Json(SystemInfo {
        name: "StationCast Playout".to_string(),
        version: st.version.clone(),
        arch,
        cpu_model,
        cpu_cores,
        load_1m: la.one as f32,
        load_5m: la.five as f32,
        load_15m: la.fifteen as f32,
        temp_c,
        hostname,
    })
}

fn read_temp_c() -> Option<f32> {
    let paths = [
        "/sys/class/thermal/thermal_zone0/temp",
        "/sys/class/hwmon/hwmon0/temp1_input",
    ];
    for p in paths {
        if let Ok(s) = std::fs::read_to_string(p) {
            if let Ok(v) = s.trim().parse::<f32>() {
                return Some(if v > 1000.0 { v / 1000.0 } else { v });
            }
        }
    }
    None
}

// --- Dashboard page -------------------------------------------------------
//
// Self-served guide page for the living-room viewer. Pure substitution into
// the template; every number it shows comes out of the guide model.

const DASHBOARD_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>StationCast</title>
    <meta http-equiv="refresh" content="5">
    <style>
        body { font-family: sans-serif; background: #111; color: #eee; padding: 2em; }
        h1 { color: #f90; }
        .clock { float: right; color: #888; font-size: 1.1em; }
        .now { font-size: 1.5em; margin-bottom: 0.5em; }
        .countdown { color: #f90; margin-bottom: 1em; }
        .upnext { font-size: 1.2em; margin-bottom: 2em; }
        .guide { position: relative; width: {{total_px}}px; max-width: 100%; margin-bottom: 2.5em; }
        .bar { display: flex; height: 3em; }
        .seg { flex: 0 0 auto; background: #333; border-right: 1px solid #111; overflow: hidden; white-space: nowrap; font-size: 0.75em; padding: 0.3em; box-sizing: border-box; }
        .seg.now { background: #f90; color: #111; }
        .tick { position: absolute; top: 3.2em; transform: translateX(-50%); color: #888; font-size: 0.75em; }
        .cursor { position: absolute; top: -0.4em; bottom: 1.2em; left: {{cursor_pct}}%; width: 2px; background: #e33; }
        ul { list-style: none; padding: 0; }
        li { margin: 0.3em 0; }
    </style>
</head>
<body>
    <div class="clock">{{clock}}</div>
    <h1>&#128250; StationCast</h1>
    <div class="now"><strong>Now Playing:</strong> {{now}}<br><em>{{show}}</em></div>
    <div class="countdown">Ends in: {{countdown}}</div>
    <div class="upnext"><strong>Up Next:</strong> {{upnext}}</div>
    <div class="guide">
        <div class="bar">{{segments}}</div>
        {{ticks}}
        <div class="cursor"></div>
    </div>
    <h2>Up Later</h2>
    <ul>{{later}}</ul>
</body>
</html>
"#;

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn render_dashboard(model: &GuideModel) -> String {
    let total_px: u32 = model.segments.iter().map(|s| s.width_px).sum();
    let mut segments = String::new();
    for seg in &model.segments {
        let class = if seg.now { "seg now" } else { "seg" };
        segments.push_str(&format!(
            r#"<div class="{class}" style="width:{}px" title="{}">{}</div>"#,
            seg.width_px,
            html_escape(&seg.label),
            html_escape(&seg.label)
        ));
    }
    let mut ticks = String::new();
    for tick in &model.hour_ticks {
        ticks.push_str(&format!(
            r#"<span class="tick" style="left:{:.2}%">{}</span>"#,
            tick.pct,
            html_escape(&tick.label)
        ));
    }
    let mut later = String::new();
    for label in &model.up_later {
        later.push_str(&format!("<li>{}</li>", html_escape(label)));
    }
    if later.is_empty() {
        later.push_str("<li>&mdash;</li>");
    }
    DASHBOARD_TEMPLATE
        .replace("{{clock}}", &html_escape(&model.clock))
        .replace("{{now}}", &html_escape(&model.now))
        .replace("{{show}}", &html_escape(&model.show))
        .replace("{{upnext}}", &html_escape(&model.upnext))
        .replace(
            "{{countdown}}",
            &html_escape(model.countdown.as_deref().unwrap_or("unknown")),
        )
        .replace("{{segments}}", &segments)
        .replace("{{ticks}}", &ticks)
        .replace("{{later}}", &later)
        .replace("{{total_px}}", &total_px.to_string())
        .replace("{{cursor_pct}}", &format!("{:.2}", model.cursor_pct))
}

async fn dashboard(State(state): State<AppState>) -> Html<String> {
    Html(render_dashboard(&current_guide(&state.stores)))
}

// --- Startup --------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();

    let data = data_dir();
    std::fs::create_dir_all(&data)
        .with_context(|| format!("failed to create data dir {}", data.display()))?;
    let stores = Stores::in_dir(&data);

    // The schedule is generated once per process start and then fixed; the
    // broadcast loop wraps around it instead of reshuffling. Not being able
    // to persist it is the one fatal condition: without the schedule file
    // the two halves of the engine have nothing to coordinate through.
    let catalog = scan_library(&media_root());
    let order = build_schedule(&catalog);
    stores
        .schedule
        .write(&order)
        .context("failed to persist the broadcast schedule")?;
    info!("schedule generated: {} items", order.len());

    let commands: Arc<dyn MediaCommands> = Arc::new(HostCommands::from_env());
    {
        let stores = stores.clone();
        let commands = commands.clone();
        std::thread::spawn(move || run_player(stores, commands));
    }

    let state = AppState {
        version,
        sys: Arc::new(tokio::sync::Mutex::new(System::new_all())),
        stores,
    };
    let app = build_router(state);

    let addr: SocketAddr = std::env::var("STATIONCAST_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;

    info!("StationCast engine starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}

// --- Tests ----------------------------------------------------------------
