use rand::Rng;
use serde::{Deserialize, Serialize};

/// Characters a room code is drawn from. 0/O and 1/I are left out so codes
/// can be read aloud or copied by hand.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 5;

/// Longest player name accepted by the lobby.
pub const MAX_NAME_LEN: usize = 15;

/// A 5-character code naming a room on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Draws a fresh code uniformly from [`ROOM_CODE_ALPHABET`]. No check is
    /// made against rooms already in use.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..ROOM_CODE_LEN)
            .map(|_| char::from(ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())]))
            .collect();
        Self(code)
    }

    /// Parses a code typed by a user. Input is trimmed and uppercased.
    pub fn parse(input: &str) -> Option<Self> {
        let code = input.trim().to_ascii_uppercase();
        let valid = code.len() == ROOM_CODE_LEN
            && code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b));
        valid.then_some(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A player as chosen in the lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub avatar: String,
}

impl Player {
    /// Builds a player the way the lobby does: the name is trimmed,
    /// uppercased and capped at [`MAX_NAME_LEN`] characters.
    pub fn new(name: &str, avatar: impl Into<String>) -> Option<Self> {
        let name: String = name.trim().to_uppercase().chars().take(MAX_NAME_LEN).collect();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name,
            avatar: avatar.into(),
        })
    }
}

/// Which side of the room this client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Joiner,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Joiner => write!(f, "joiner"),
        }
    }
}

/// Rule set picked by the host in the lobby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameMode {
    #[default]
    Classic,
    PowerUps,
}

/// Local lifecycle of one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameState {
    #[default]
    Lobby,
    Playing,
    /// This peer solved the round, the opponent has not reported yet.
    WaitingResult,
    GameOver,
}

impl std::fmt::Display for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lobby => write!(f, "LOBBY"),
            Self::Playing => write!(f, "PLAYING"),
            Self::WaitingResult => write!(f, "WAITING_RESULT"),
            Self::GameOver => write!(f, "GAME_OVER"),
        }
    }
}

/// Round parameters generated by the host and sent verbatim to the joiner.
///
/// `min_range < target_number < max_range` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundConfig {
    pub min_range: i32,
    pub max_range: i32,
    pub target_number: i32,
    pub room_id: RoomCode,
    pub host_name: String,
    pub host_avatar: String,
    pub joiner_name: String,
    pub joiner_avatar: String,
    #[serde(default)]
    pub game_mode: GameMode,
}

impl RoundConfig {
    pub fn host(&self) -> Player {
        Player {
            name: self.host_name.clone(),
            avatar: self.host_avatar.clone(),
        }
    }

    pub fn joiner(&self) -> Player {
        Player {
            name: self.joiner_name.clone(),
            avatar: self.joiner_avatar.clone(),
        }
    }

    /// The player on the other side from `role`.
    pub fn opponent_of(&self, role: Role) -> Player {
        match role {
            Role::Host => self.joiner(),
            Role::Joiner => self.host(),
        }
    }
}

/// Impairment one peer can inflict on the other in power-up mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Effect {
    /// Scrambles the opponent's display.
    Glitch,
    /// Blocks the opponent's input.
    Freeze,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: RoomCode,
    pub player_name: String,
    #[serde(default)]
    pub player_avatar: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedPayload {
    pub room_id: RoomCode,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub room_id: RoomCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RematchPayload {
    pub room_id: RoomCode,
    pub requester_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectPayload {
    pub room_id: RoomCode,
    pub effect: Effect,
    /// Milliseconds.
    pub duration: u64,
}

/// Messages exchanged between the two peers of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Join(JoinPayload),
    StartGame(RoundConfig),
    PlayerFinished(FinishedPayload),
    Restart(RoomPayload),
    RematchRequest(RematchPayload),
    RematchAccepted(RoomPayload),
    RematchDeclined(RoomPayload),
    PowerUpEffect(EffectPayload),
}

impl Message {
    /// Room the message is addressed to.
    pub fn room_id(&self) -> &RoomCode {
        match self {
            Self::Join(p) => &p.room_id,
            Self::StartGame(p) => &p.room_id,
            Self::PlayerFinished(p) => &p.room_id,
            Self::Restart(p) | Self::RematchAccepted(p) | Self::RematchDeclined(p) => &p.room_id,
            Self::RematchRequest(p) => &p.room_id,
            Self::PowerUpEffect(p) => &p.room_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "JOIN",
            Self::StartGame(_) => "START_GAME",
            Self::PlayerFinished(_) => "PLAYER_FINISHED",
            Self::Restart(_) => "RESTART",
            Self::RematchRequest(_) => "REMATCH_REQUEST",
            Self::RematchAccepted(_) => "REMATCH_ACCEPTED",
            Self::RematchDeclined(_) => "REMATCH_DECLINED",
            Self::PowerUpEffect(_) => "POWER_UP_EFFECT",
        }
    }
}

/// What actually travels over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Present on shared-bus transports so a client can drop its own echoes.
    #[serde(rename = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(flatten)]
    pub message: Message,
}
