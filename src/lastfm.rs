//! Last.fm listening history: wire format, validation and a blocking client.
//!
//! Responses are decoded into loose serde structs first, then validated item by
//! item. A bad item is a `MalformedRecord` for that item only; a page without
//! its paging attributes is malformed as a whole.

use serde::Deserialize;
use std::thread::sleep;
use tracing::{debug, warn};

use crate::config::{HttpConfig, LastFmConfig};
use crate::error::{Error, Result};
use crate::models::{PlayRecord, RemoteTrack};

pub const METHOD_RECENT_TRACKS: &str = "user.getrecenttracks";
pub const METHOD_USER_INFO: &str = "user.getinfo";

// ============================================================================
// Wire Format
// ============================================================================

/// Last.fm sends a lone object instead of a one-element array.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => vec![t],
        }
    }
}

/// Counters and timestamps arrive as strings, occasionally as numbers.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum Numeric {
    Number(i64),
    Text(String),
}

impl Numeric {
    fn parse(&self) -> Option<i64> {
        match self {
            Numeric::Number(n) => Some(*n),
            Numeric::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct TextField {
    #[serde(rename = "#text")]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireDate {
    uts: Option<Numeric>,
}

#[derive(Deserialize, Debug)]
struct TrackAttr {
    nowplaying: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireTrack {
    mbid: Option<String>,
    name: Option<String>,
    artist: Option<TextField>,
    album: Option<TextField>,
    date: Option<WireDate>,
    #[serde(rename = "@attr")]
    attr: Option<TrackAttr>,
}

#[derive(Deserialize, Debug)]
struct PageAttr {
    page: Option<Numeric>,
    #[serde(rename = "totalPages")]
    total_pages: Option<Numeric>,
    total: Option<Numeric>,
}

#[derive(Deserialize, Debug)]
struct RecentTracks {
    /// Decoded per element so one badly typed item cannot sink the page
    #[serde(default)]
    track: OneOrMany<serde_json::Value>,
    #[serde(rename = "@attr")]
    attr: Option<PageAttr>,
}

#[derive(Deserialize, Debug)]
struct RecentTracksResponse {
    recenttracks: RecentTracks,
}

#[derive(Deserialize, Debug)]
struct WireUser {
    name: String,
    playcount: Numeric,
    track_count: Option<Numeric>,
}

#[derive(Deserialize, Debug)]
struct UserInfoResponse {
    user: WireUser,
}

#[derive(Deserialize, Debug)]
struct ApiErrorPayload {
    error: i64,
    message: String,
}

// ============================================================================
// Validated Records
// ============================================================================

/// One element of a history page after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum PageItem {
    Play(PlayRecord),
    /// Missing a mandatory field; carries the reason
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub page: u32,
    pub total_pages: u32,
    pub total: u64,
    pub items: Vec<PageItem>,
    /// Now-playing and undated entries, dropped silently
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub play_count: u64,
    pub track_count: u64,
}

fn text(field: Option<TextField>) -> Option<String> {
    field.and_then(|f| f.text)
}

/// Decode a body, turning `{error, message}` payloads into `Error::Api`.
fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    if value.get("error").is_some() {
        if let Ok(e) = serde_json::from_value::<ApiErrorPayload>(value.clone()) {
            return Err(Error::Api {
                code: e.error,
                message: e.message,
            });
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Error for a failed status: the API's own error payload if the body has one,
/// otherwise a plain HTTP error. Proxies answer 5xx with HTML.
fn status_error(method: &str, status: u16, body: &str) -> Error {
    match decode::<serde_json::Value>(body) {
        Err(e @ Error::Api { .. }) => e,
        _ => Error::Http(format!("{method}: HTTP {status}")),
    }
}

enum Validated {
    Play(PlayRecord),
    Skip,
}

fn validate_track(t: WireTrack) -> std::result::Result<Validated, String> {
    let now_playing = t
        .attr
        .as_ref()
        .and_then(|a| a.nowplaying.as_deref())
        .is_some_and(|v| v == "true");
    if now_playing {
        return Ok(Validated::Skip);
    }
    let Some(date) = t.date else {
        return Ok(Validated::Skip);
    };
    let name = t.name.filter(|n| !n.is_empty()).ok_or("missing track name")?;
    let artist = text(t.artist)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| format!("missing artist for {name:?}"))?;
    let timestamp = date
        .uts
        .as_ref()
        .and_then(Numeric::parse)
        .ok_or_else(|| format!("bad timestamp for {name:?}"))?;
    Ok(Validated::Play(PlayRecord {
        track: RemoteTrack::new(name, artist, text(t.album), t.mbid),
        timestamp,
    }))
}

fn page_number(value: Option<&Numeric>, what: &str) -> Result<i64> {
    value
        .and_then(Numeric::parse)
        .ok_or_else(|| Error::malformed("page", format!("missing {what}")))
}

/// Parse one `user.getrecenttracks` response body.
pub fn parse_recent_tracks(body: &str) -> Result<HistoryPage> {
    let response: RecentTracksResponse = decode(body)?;
    let attr = response
        .recenttracks
        .attr
        .ok_or_else(|| Error::malformed("page", "missing @attr"))?;
    let page = page_number(attr.page.as_ref(), "page")?;
    let total_pages = page_number(attr.total_pages.as_ref(), "totalPages")?;
    let total = attr.total.as_ref().and_then(Numeric::parse).unwrap_or(0);

    let mut items = Vec::new();
    let mut skipped = 0;
    for value in response.recenttracks.track.into_vec() {
        let decoded = serde_json::from_value::<WireTrack>(value)
            .map_err(|e| format!("undecodable track: {e}"))
            .and_then(validate_track);
        match decoded {
            Ok(Validated::Play(p)) => items.push(PageItem::Play(p)),
            Ok(Validated::Skip) => skipped += 1,
            Err(reason) => items.push(PageItem::Malformed(reason)),
        }
    }
    Ok(HistoryPage {
        page: page.max(0) as u32,
        total_pages: total_pages.max(0) as u32,
        total: total.max(0) as u64,
        items,
        skipped,
    })
}

/// Parse one `user.getinfo` response body.
pub fn parse_user_info(body: &str) -> Result<UserInfo> {
    let response: UserInfoResponse = decode(body)?;
    let u = response.user;
    let play_count = u
        .playcount
        .parse()
        .ok_or_else(|| Error::malformed("user", "bad playcount"))?;
    let track_count = u.track_count.as_ref().and_then(Numeric::parse).unwrap_or(0);
    Ok(UserInfo {
        name: u.name,
        play_count: play_count.max(0) as u64,
        track_count: track_count.max(0) as u64,
    })
}

// ============================================================================
// Source Trait + Client
// ============================================================================

/// Anything that can serve pages of listening history, newest first.
pub trait HistorySource {
    fn fetch_page(&mut self, page: u32) -> Result<HistoryPage>;
    fn user_info(&mut self) -> Result<UserInfo>;
}

pub struct LastFmClient {
    http: reqwest::blocking::Client,
    http_cfg: HttpConfig,
    cfg: LastFmConfig,
}

impl LastFmClient {
    pub fn new(http_cfg: HttpConfig, cfg: LastFmConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(http_cfg.timeout)
            .connect_timeout(http_cfg.connect_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Http(format!("build client: {e}")))?;
        Ok(Self { http, http_cfg, cfg })
    }

    /// GET one API method, retrying rate limits, server errors and transport failures.
    fn call(&self, method: &str, extra: &[(&str, String)]) -> Result<String> {
        let mut query: Vec<(&str, String)> = vec![
            ("method", method.to_string()),
            ("user", self.cfg.user.clone()),
            ("api_key", self.cfg.api_key.clone()),
            ("format", "json".to_string()),
        ];
        query.extend(extra.iter().cloned());

        let mut attempt = 0;
        loop {
            let backoff = self.http_cfg.backoff * (1u32 << attempt.min(6));
            match self.http.get(&self.cfg.api_base).query(&query).send() {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text()?;
                    if status.is_success() {
                        debug!(method, %status, "lastfm.response");
                        return Ok(body);
                    }
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable || attempt >= self.http_cfg.max_retries {
                        return Err(status_error(method, status.as_u16(), &body));
                    }
                    warn!(method, %status, backoff_ms = backoff.as_millis() as u64, "lastfm.retry");
                }
                Err(e) => {
                    if attempt >= self.http_cfg.max_retries {
                        return Err(e.into());
                    }
                    warn!(
                        method,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "lastfm.retry.error"
                    );
                }
            }
            sleep(backoff);
            attempt += 1;
        }
    }
}

impl HistorySource for LastFmClient {
    fn fetch_page(&mut self, page: u32) -> Result<HistoryPage> {
        let body = self.call(
            METHOD_RECENT_TRACKS,
            &[("extended", "0".to_string()), ("page", page.to_string())],
        )?;
        parse_recent_tracks(&body)
    }

    fn user_info(&mut self) -> Result<UserInfo> {
        let body = self.call(METHOD_USER_INFO, &[])?;
        parse_user_info(&body)
    }
}

// ============================================================================
// History Iterator
// ============================================================================

/// Walks history from `start` until the last page.
///
/// Yields every item; malformed ones as `MalformedRecord` of kind "track".
/// A failed page fetch is yielded once and ends the walk.
pub struct PlayHistory<'a, S: HistorySource + ?Sized> {
    source: &'a mut S,
    next_page: Option<u32>,
    buffer: std::vec::IntoIter<PageItem>,
    /// Last page fetched and the total, for progress reporting
    pub position: Option<(u32, u32)>,
}

impl<'a, S: HistorySource + ?Sized> PlayHistory<'a, S> {
    pub fn new(source: &'a mut S, start: u32) -> Self {
        Self {
            source,
            next_page: Some(start.max(1)),
            buffer: Vec::new().into_iter(),
            position: None,
        }
    }
}

impl<S: HistorySource + ?Sized> Iterator for PlayHistory<'_, S> {
    type Item = Result<PlayRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.buffer.next() {
                Some(PageItem::Play(p)) => return Some(Ok(p)),
                Some(PageItem::Malformed(reason)) => {
                    return Some(Err(Error::malformed("track", reason)))
                }
                None => {}
            }
            let page = self.next_page.take()?;
            match self.source.fetch_page(page) {
                Ok(fetched) => {
                    debug!(
                        page = fetched.page,
                        total_pages = fetched.total_pages,
                        "Fetched history page"
                    );
                    self.position = Some((fetched.page, fetched.total_pages));
                    if fetched.page < fetched.total_pages {
                        self.next_page = Some(fetched.page + 1);
                    }
                    self.buffer = fetched.items.into_iter();
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
