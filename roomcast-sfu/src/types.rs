//! Common types used throughout the SFU implementation

use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Highest spatial layer index (quarter = 0, half = 1, full = 2)
pub const MAX_SPATIAL_LAYER: usize = 2;

/// Highest temporal layer index
pub const MAX_TEMPORAL_LAYER: usize = 3;

/// RID of the full resolution simulcast encoding
pub const FULL_RESOLUTION: &str = "f";
/// RID of the half resolution simulcast encoding
pub const HALF_RESOLUTION: &str = "h";
/// RID of the quarter resolution simulcast encoding
pub const QUARTER_RESOLUTION: &str = "q";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier of one live participant session
    ParticipantId
);

string_id!(
    /// Stable logical participant name that survives reconnects
    ParticipantIdentity
);

string_id!(
    /// Unique identifier for a published track within a room
    TrackId
);

string_id!(
    /// Identifier of a media node hosting subscribers of a track
    NodeId
);

impl ParticipantId {
    /// Generate a fresh participant ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("PA_{}", nanoid::nanoid!(12)))
    }
}

impl TrackId {
    /// Generate a fresh track ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("TR_{}", nanoid::nanoid!(12)))
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Simulcast video quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
    Off,
}

impl VideoQuality {
    /// Spatial layer carrying this quality, `None` when video is off
    #[must_use]
    pub const fn spatial_layer(&self) -> Option<i32> {
        match self {
            Self::Low => Some(0),
            Self::Medium => Some(1),
            Self::High => Some(2),
            Self::Off => None,
        }
    }

    /// Get the RID (restriction identifier) for this quality
    #[must_use]
    pub const fn rid(&self) -> &'static str {
        match self {
            Self::High => FULL_RESOLUTION,
            Self::Medium => HALF_RESOLUTION,
            Self::Low | Self::Off => QUARTER_RESOLUTION,
        }
    }
}

/// Map a simulcast RID onto its spatial layer index
#[must_use]
pub fn rid_to_layer(rid: &str) -> i32 {
    match rid {
        FULL_RESOLUTION => 2,
        HALF_RESOLUTION => 1,
        _ => 0,
    }
}

/// Connection state of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    Joining,
    Joined,
    Active,
    Disconnected,
}

/// One published simulcast layer as advertised over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoLayer {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub ssrc: u32,
}

/// Wire-format descriptor of a published track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub sid: TrackId,
    pub kind: TrackKind,
    pub name: String,
    pub muted: bool,
    pub simulcast: bool,
    pub layers: Vec<VideoLayer>,
}
