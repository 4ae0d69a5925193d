//! Room directory over the server's HTTP API
//!
//! Used out of band from the WebSocket to validate a room before joining and
//! to create or list rooms.

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info};

use crate::sync::{RoomCreated, RoomSummary};

use super::room_code::RoomId;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {0}")]
    Status(u16),
    #[error("Server returned an invalid room id: {0}")]
    InvalidRoomId(String),
}

/// HTTP client for the room directory
pub struct RoomDirectory {
    client: Client,
    base_url: String,
}

impl RoomDirectory {
    /// `base_url` is the server's HTTP origin, e.g. `http://localhost:8080`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Look up a room. `Ok(None)` when the server does not know it.
    pub async fn room(&self, room_id: &RoomId) -> Result<Option<RoomSummary>, DirectoryError> {
        let url = format!("{}/api/rooms/{}", self.base_url, room_id);
        debug!("Directory: looking up room {}", room_id);

        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(DirectoryError::Status(status.as_u16())),
        }
    }

    pub async fn room_exists(&self, room_id: &RoomId) -> Result<bool, DirectoryError> {
        Ok(self.room(room_id).await?.is_some())
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, DirectoryError> {
        let url = format!("{}/api/rooms", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    /// Ask the server to create a fresh room
    pub async fn create_room(&self) -> Result<RoomId, DirectoryError> {
        let url = format!("{}/api/rooms", self.base_url);
        let response = self.client.post(&url).send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }

        let created: RoomCreated = response.json().await?;
        let room_id = RoomId::parse(&created.room_id)
            .ok_or_else(|| DirectoryError::InvalidRoomId(created.room_id.clone()))?;
        info!("Directory: created room {}", room_id);
        Ok(room_id)
    }
}
