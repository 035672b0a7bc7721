use std::sync::Arc;
use surf::StatusCode;

use crate::config::Config;
use crate::token::{Grant, StaleToken, TokenCache, TokenSource};
use crate::LOG;

/// Long-lived app credentials used to mint access tokens
#[derive(Clone)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
    // an "infinite-lived" token issued once through the authorization-code flow
    pub refresh_token: String,
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
}

impl RefreshParams {
    fn from_token(token: &str) -> Self {
        RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: token.to_string(),
        }
    }
}

/// Exchanges the refresh token for a new access token
pub struct SpotifyRefresh {
    credentials: SpotifyCredentials,
    token_url: String,
}

impl SpotifyRefresh {
    pub fn new(credentials: SpotifyCredentials, token_url: &str) -> Self {
        Self {
            credentials,
            token_url: token_url.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for SpotifyRefresh {
    fn name(&self) -> &'static str {
        "spotify"
    }

    async fn fetch(&self) -> crate::Result<Grant> {
        let auth = base64::encode(
            format!(
                "{}:{}",
                self.credentials.client_id, self.credentials.client_secret
            )
            .as_bytes(),
        );
        let body = surf::Body::from_form(&RefreshParams::from_token(
            &self.credentials.refresh_token,
        ))
        .map_err(|_| "error generating form data from refresh params")?;
        let mut resp = surf::post(&self.token_url)
            .body(body)
            .header("authorization", format!("Basic {}", auth))
            .send()
            .await
            .map_err(|e| se!("account refresh request error {:?}", e))?;
        if !resp.status().is_success() {
            let body = resp.body_string().await.unwrap_or_default();
            return Err(se!("account refresh failed with {}: {}", resp.status(), body).into());
        }
        let access: Grant = resp
            .body_json()
            .await
            .map_err(|e| se!("account refresh json parse error {:?}", e))?;
        Ok(access)
    }
}

#[derive(serde::Deserialize, Debug)]
struct Artist {
    name: String,
}

#[derive(serde::Deserialize, Debug)]
struct Track {
    name: String,
    duration_ms: i64,
    #[serde(default)]
    artists: Vec<Artist>,
}

impl Track {
    // tracks can have several contributing artists, only the first is shown
    fn first_artist(&self) -> String {
        self.artists
            .first()
            .map(|a| a.name.clone())
            .unwrap_or_default()
    }
}

#[derive(serde::Deserialize, Debug)]
struct CurrentlyPlaying {
    is_playing: bool,
    progress_ms: Option<i64>,
    // null for podcast episodes, ads and other non-track items
    item: Option<Track>,
}

#[derive(serde::Deserialize, Debug)]
struct PlayHistory {
    track: Track,
}

#[derive(serde::Deserialize, Debug)]
struct RecentlyPlayed {
    items: Vec<PlayHistory>,
}

/// What `GET /now-playing` returns
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CurrentSong {
    pub is_playing: bool,
    pub progress_ms: i64,
    #[serde(rename = "song_duration_ms")]
    pub duration_ms: i64,
    pub song: String,
    pub artist: String,
}

impl CurrentSong {
    fn playing(current: CurrentlyPlaying, track: Track) -> Self {
        Self {
            is_playing: current.is_playing,
            progress_ms: current.progress_ms.unwrap_or(0),
            duration_ms: track.duration_ms,
            artist: track.first_artist(),
            song: track.name,
        }
    }

    // a track from the play history has been played through
    fn last_played(track: Track) -> Self {
        Self {
            is_playing: false,
            progress_ms: track.duration_ms,
            duration_ms: track.duration_ms,
            artist: track.first_artist(),
            song: track.name,
        }
    }
}

pub struct SpotifyClient {
    tokens: Arc<TokenCache<SpotifyRefresh>>,
    api_url: String,
}

impl SpotifyClient {
    pub fn new(tokens: Arc<TokenCache<SpotifyRefresh>>, api_url: &str) -> Self {
        Self {
            tokens,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let tokens = TokenCache::new(
            SpotifyRefresh::new(config.spotify.clone(), &config.spotify_token_url),
            chrono::Duration::seconds(config.token_expiry_buffer_seconds),
        );
        Self::new(Arc::new(tokens), &config.spotify_api_url)
    }

    async fn access_token(&self) -> crate::Result<String> {
        match self.tokens.get_token().await {
            Ok(token) => Ok(token),
            // the auth server may still honor a recently expired token
            Err(StaleToken { token, source }) if !token.is_empty() => {
                slog::warn!(LOG, "using possibly expired spotify token"; "error" => %source);
                Ok(token)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `None` when nothing is playing right now
    async fn get_currently_playing(&self) -> crate::Result<Option<CurrentlyPlaying>> {
        let access_token = self.access_token().await?;
        let mut resp = surf::get(format!("{}/me/player/currently-playing", self.api_url))
            .header("authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| format!("get currently playing error {:?}", e))?;
        if resp.status() == StatusCode::NoContent {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let body = resp.body_string().await.unwrap_or_default();
            return Err(se!("get currently playing failed with {}: {}", resp.status(), body).into());
        }
        let body = resp
            .body_string()
            .await
            .map_err(|e| format!("get currently playing body error {:?}", e))?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let current: CurrentlyPlaying = serde_json::from_str(&body)
            .map_err(|e| format!("get currently playing json error {:?}", e))?;
        Ok(Some(current))
    }

    async fn get_last_played(&self) -> crate::Result<Track> {
        let access_token = self.access_token().await?;
        let mut resp = surf::get(format!("{}/me/player/recently-played?limit=1", self.api_url))
            .header("authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| format!("get history error {:?}", e))?;
        if !resp.status().is_success() {
            let body = resp.body_string().await.unwrap_or_default();
            return Err(se!("get history failed with {}: {}", resp.status(), body).into());
        }
        let recent: RecentlyPlayed = resp
            .body_json()
            .await
            .map_err(|e| format!("get history json error {:?}", e))?;
        let last = recent
            .items
            .into_iter()
            .next()
            .ok_or_else(|| se!("play history is empty"))?;
        Ok(last.track)
    }

    /// The track playing right now, or the most recently played one
    pub async fn current_song(&self) -> crate::Result<CurrentSong> {
        if let Some(mut current) = self.get_currently_playing().await? {
            if let Some(track) = current.item.take() {
                return Ok(CurrentSong::playing(current, track));
            }
            slog::debug!(LOG, "currently playing item is not a track");
        }
        let track = self.get_last_played().await?;
        Ok(CurrentSong::last_played(track))
    }
}
