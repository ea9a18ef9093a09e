//! Client-side game session state machine.
//!
//! Each peer runs its own copy. The machine never touches the network: every
//! operation returns the [`Outbound`] actions the caller must carry out
//! through the session service, in order.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{GuessError, PowerError};
use crate::guess::{self, Direction, GuessHistory, GuessRecord};
use crate::powers::{self, Activation, Heat, Loadout, PowerState};
use crate::types::*;

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    StartGame(RoundConfig),
    Finished(u32),
    Restart,
    RequestRematch { requester_name: String },
    AcceptRematch,
    DeclineRematch,
    Effect { effect: Effect, duration: Duration },
    /// Release the transport.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Rematch {
    #[default]
    Idle,
    /// We asked and are waiting for an answer.
    Requested,
    /// The opponent asked.
    Incoming { requester: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Victory,
    Draw,
    Defeat,
}

/// Result of one accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub records: Vec<GuessRecord>,
    /// Values of a double shot that were skipped as duplicates.
    pub skipped: Vec<i32>,
    pub finished: Option<u32>,
    pub heat: Option<Heat>,
    pub outbound: Vec<Outbound>,
}

/// Builds a round: bounds in `1..=15` and `90..=110`, target strictly inside.
pub fn generate_round<R: Rng + ?Sized>(
    rng: &mut R,
    room: RoomCode,
    host: &Player,
    joiner: &Player,
    mode: GameMode,
) -> RoundConfig {
    let min_range = rng.random_range(1..=15);
    let max_range = rng.random_range(90..=110);
    let target_number = rng.random_range(min_range + 1..max_range);
    RoundConfig {
        min_range,
        max_range,
        target_number,
        room_id: room,
        host_name: host.name.clone(),
        host_avatar: host.avatar.clone(),
        joiner_name: joiner.name.clone(),
        joiner_avatar: joiner.avatar.clone(),
        game_mode: mode,
    }
}

#[derive(Debug, Default)]
pub struct GameSession {
    state: GameState,
    role: Option<Role>,
    room: Option<RoomCode>,
    player: Option<Player>,
    opponent: Option<Player>,
    mode: GameMode,
    loadout: Option<Loadout>,
    config: Option<RoundConfig>,
    history: GuessHistory,
    powers: Option<PowerState>,
    my_attempts: u32,
    opponent_attempts: Option<u32>,
    rematch: Rematch,
    status: String,
}

impl GameSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn room(&self) -> Option<&RoomCode> {
        self.room.as_ref()
    }

    pub fn player(&self) -> Option<&Player> {
        self.player.as_ref()
    }

    pub fn opponent(&self) -> Option<&Player> {
        self.opponent.as_ref()
    }

    pub fn config(&self) -> Option<&RoundConfig> {
        self.config.as_ref()
    }

    pub fn history(&self) -> &GuessHistory {
        &self.history
    }

    pub fn powers(&self) -> Option<&PowerState> {
        self.powers.as_ref()
    }

    pub fn my_attempts(&self) -> u32 {
        self.my_attempts
    }

    pub fn opponent_attempts(&self) -> Option<u32> {
        self.opponent_attempts
    }

    pub fn rematch(&self) -> &Rematch {
        &self.rematch
    }

    /// One-line status for the player.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Classification shown on the result screen.
    pub fn outcome(&self) -> Option<Outcome> {
        if self.state() != GameState::GameOver {
            return None;
        }
        let theirs = self.opponent_attempts?;
        Some(match self.my_attempts.cmp(&theirs) {
            std::cmp::Ordering::Less => Outcome::Victory,
            std::cmp::Ordering::Equal => Outcome::Draw,
            std::cmp::Ordering::Greater => Outcome::Defeat,
        })
    }

    /// Abilities used from the next round on.
    pub fn set_loadout(&mut self, loadout: Loadout) {
        self.loadout = Some(loadout);
    }

    // ─── Lobby ────────────────────────────────────────────────────

    /// Prepares to host `room`. The transport is opened by the caller.
    pub fn create_room(&mut self, room: RoomCode, player: Player, mode: GameMode) {
        self.reset(true);
        self.role = Some(Role::Host);
        self.room = Some(room);
        self.player = Some(player);
        self.mode = mode;
        self.status = "CREATING ROOM...".to_string();
    }

    pub fn hosted(&mut self) {
        if let Some(room) = &self.room {
            self.status = format!("CODE: {}", room);
        }
    }

    pub fn begin_join(&mut self, room: RoomCode, player: Player) {
        self.reset(true);
        self.role = Some(Role::Joiner);
        self.room = Some(room);
        self.player = Some(player);
        self.status = "CONNECTING TO ROOM...".to_string();
    }

    pub fn joined(&mut self) {
        self.status = "WAITING FOR HOST TO START...".to_string();
    }

    /// The transport could not be reached. The caller resets to the lobby
    /// after a delay.
    pub fn connection_failed(&mut self) {
        self.status = match self.role {
            Some(Role::Joiner) => "JOIN FAILED. TRY AGAIN.".to_string(),
            _ => "COULD NOT CREATE ROOM.".to_string(),
        };
    }

    // ─── Inbound ──────────────────────────────────────────────────

    /// Applies a message from the opponent.
    pub fn handle_message<R: Rng + ?Sized>(&mut self, message: Message, rng: &mut R, now: Instant) -> Vec<Outbound> {
        let Some(room) = &self.room else {
            tracing::debug!("Dropping {}: not in a room", message.kind());
            return Vec::new();
        };
        if message.room_id() != room {
            tracing::debug!("Dropping {} for room {}", message.kind(), message.room_id());
            return Vec::new();
        }

        match message {
            Message::Join(join) => self.on_join(join, rng),
            Message::StartGame(config) => self.on_start_game(config),
            Message::PlayerFinished(finished) => {
                self.on_opponent_finished(finished.attempts);
                Vec::new()
            }
            Message::Restart(_) => {
                self.reset(false);
                Vec::new()
            }
            Message::RematchRequest(request) => self.on_rematch_request(request.requester_name, rng),
            Message::RematchAccepted(_) => self.on_rematch_accepted(rng),
            Message::RematchDeclined(_) => {
                if self.state() != GameState::GameOver {
                    tracing::debug!("Ignoring REMATCH_DECLINED while {}", self.state());
                    return Vec::new();
                }
                tracing::info!("Opponent declined the rematch");
                self.reset(true);
                vec![Outbound::Disconnect]
            }
            Message::PowerUpEffect(effect) => {
                self.on_effect(effect, now);
                Vec::new()
            }
        }
    }

    fn on_join<R: Rng + ?Sized>(&mut self, join: JoinPayload, rng: &mut R) -> Vec<Outbound> {
        if self.role != Some(Role::Host) {
            return Vec::new();
        }
        if !matches!(self.state(), GameState::Lobby | GameState::GameOver) {
            tracing::debug!("Ignoring JOIN while {}", self.state());
            return Vec::new();
        }
        tracing::info!("Host received JOIN from {}, starting game", join.player_name);
        self.opponent = Some(Player {
            name: join.player_name,
            avatar: join.player_avatar,
        });
        self.start_round(rng)
    }

    fn on_start_game(&mut self, config: RoundConfig) -> Vec<Outbound> {
        if self.role != Some(Role::Joiner) {
            return Vec::new();
        }
        if !matches!(self.state(), GameState::Lobby | GameState::GameOver) {
            tracing::debug!("Ignoring START_GAME while {}", self.state());
            return Vec::new();
        }
        tracing::info!("Joiner received START_GAME");
        self.mode = config.game_mode;
        self.opponent = Some(config.opponent_of(Role::Joiner));
        self.begin_round(config);
        Vec::new()
    }

    fn on_opponent_finished(&mut self, attempts: u32) {
        self.opponent_attempts = Some(attempts);
        if self.state() == GameState::WaitingResult {
            self.set_state(GameState::GameOver);
            self.status.clear();
        }
    }

    fn on_rematch_request<R: Rng + ?Sized>(&mut self, requester: String, rng: &mut R) -> Vec<Outbound> {
        if self.state() != GameState::GameOver {
            return Vec::new();
        }
        if self.rematch == Rematch::Requested {
            // Both asked at once: treat as agreement.
            return match self.role {
                Some(Role::Host) => self.start_round(rng),
                _ => {
                    self.status = "STARTING REMATCH...".to_string();
                    Vec::new()
                }
            };
        }
        self.status = format!("{} WANTS A REMATCH", requester);
        self.rematch = Rematch::Incoming { requester };
        Vec::new()
    }

    fn on_rematch_accepted<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<Outbound> {
        if self.state() != GameState::GameOver || self.rematch != Rematch::Requested {
            return Vec::new();
        }
        match self.role {
            Some(Role::Host) => self.start_round(rng),
            _ => {
                self.status = "STARTING REMATCH...".to_string();
                Vec::new()
            }
        }
    }

    fn on_effect(&mut self, payload: EffectPayload, now: Instant) {
        if self.mode != GameMode::PowerUps || self.state() != GameState::Playing {
            return;
        }
        let Some(powers) = self.powers.as_mut() else {
            return;
        };
        let duration = Duration::from_millis(payload.duration);
        if powers.receive(payload.effect, duration, now) {
            tracing::info!("Hit by {:?} for {:?}", payload.effect, duration);
        } else {
            tracing::info!("Firewall blocked {:?}", payload.effect);
        }
    }

    // ─── Local actions ────────────────────────────────────────────

    /// Submits a guess typed by the player. With an armed double shot the
    /// input may hold two comma-separated values.
    pub fn submit_guess(&mut self, input: &str, now: Instant) -> Result<Turn, GuessError> {
        if self.state() != GameState::Playing {
            return Err(GuessError::NotPlaying);
        }
        let Some(config) = self.config.clone() else {
            return Err(GuessError::NotPlaying);
        };
        if self.powers.as_ref().is_some_and(|p| p.is_frozen(now)) {
            return Err(GuessError::InputFrozen);
        }

        let double = self.powers.as_ref().is_some_and(|p| p.double_shot_armed());
        let values = if double {
            input
                .split(',')
                .take(2)
                .map(guess::parse_guess)
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![guess::parse_guess(input)?]
        };
        if let Some(powers) = self.powers.as_mut() {
            powers.take_double_shot();
        }

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        let mut finished = None;
        for value in values {
            match self.history.submit(value, config.target_number) {
                Ok(submission) => {
                    records.push(submission.record);
                    if submission.finished.is_some() {
                        finished = submission.finished;
                        break;
                    }
                }
                Err(GuessError::AlreadyGuessed(v)) => skipped.push(v),
                Err(e) => return Err(e),
            }
        }
        if records.is_empty() {
            return Err(GuessError::AlreadyGuessed(skipped.first().copied().unwrap_or_default()));
        }

        let heat = match (records.last(), self.powers.as_ref()) {
            (Some(last), Some(p)) if p.thermal() => Some(powers::heat(last.value, &config)),
            _ => None,
        };

        let mut outbound = Vec::new();
        if let Some(attempts) = finished {
            outbound.push(self.finish(attempts));
        }
        Ok(Turn {
            records,
            skipped,
            finished,
            heat,
            outbound,
        })
    }

    fn finish(&mut self, attempts: u32) -> Outbound {
        self.my_attempts = attempts;
        if self.opponent_attempts.is_some() {
            self.set_state(GameState::GameOver);
            self.status.clear();
        } else {
            self.set_state(GameState::WaitingResult);
            let name = self.opponent.as_ref().map(|o| o.name.as_str()).unwrap_or("OPPONENT");
            self.status = format!("WAITING FOR {} TO FINISH...", name);
        }
        Outbound::Finished(attempts)
    }

    /// Triggers the active ability for this round.
    pub fn activate_power(&mut self) -> Result<(Activation, Vec<Outbound>), PowerError> {
        if self.mode != GameMode::PowerUps || self.state() != GameState::Playing {
            return Err(PowerError::Unavailable);
        }
        let target = self.config.as_ref().map(|c| c.target_number).ok_or(PowerError::Unavailable)?;
        let powers = self.powers.as_mut().ok_or(PowerError::NoLoadout)?;
        let activation = powers.activate(target)?;
        let outbound = match activation {
            Activation::Inflict { effect, duration } => vec![Outbound::Effect { effect, duration }],
            _ => Vec::new(),
        };
        Ok((activation, outbound))
    }

    pub fn request_rematch(&mut self) -> Vec<Outbound> {
        if self.state() != GameState::GameOver || self.rematch != Rematch::Idle {
            return Vec::new();
        }
        let Some(player) = &self.player else {
            return Vec::new();
        };
        let requester_name = player.name.clone();
        self.rematch = Rematch::Requested;
        self.status = "WAITING FOR OPPONENT...".to_string();
        vec![Outbound::RequestRematch { requester_name }]
    }

    /// Accepts the opponent's pending request. A host starts the next round
    /// right away; a joiner tells the host to.
    pub fn accept_rematch<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<Outbound> {
        if self.state() != GameState::GameOver || !matches!(self.rematch, Rematch::Incoming { .. }) {
            return Vec::new();
        }
        match self.role {
            Some(Role::Host) => self.start_round(rng),
            _ => {
                self.rematch = Rematch::Idle;
                self.status = "STARTING REMATCH...".to_string();
                vec![Outbound::AcceptRematch]
            }
        }
    }

    pub fn decline_rematch(&mut self) -> Vec<Outbound> {
        if self.state() != GameState::GameOver || !matches!(self.rematch, Rematch::Incoming { .. }) {
            return Vec::new();
        }
        self.reset(true);
        vec![Outbound::DeclineRematch, Outbound::Disconnect]
    }

    /// Sends both peers back to the lobby without leaving the room.
    pub fn restart(&mut self) -> Vec<Outbound> {
        if self.room.is_none() {
            return Vec::new();
        }
        self.reset(false);
        vec![Outbound::Restart]
    }

    /// Leaves the room from any state.
    pub fn exit(&mut self) -> Vec<Outbound> {
        self.reset(true);
        vec![Outbound::Disconnect]
    }

    // ─── Internals ────────────────────────────────────────────────

    fn start_round<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<Outbound> {
        let (Some(room), Some(host)) = (self.room.clone(), self.player.as_ref()) else {
            return Vec::new();
        };
        let Some(joiner) = self.opponent.as_ref() else {
            return Vec::new();
        };
        let config = generate_round(rng, room, host, joiner, self.mode);
        tracing::info!(
            "Starting round {}..{} in {}",
            config.min_range,
            config.max_range,
            config.room_id
        );
        self.begin_round(config.clone());
        vec![Outbound::StartGame(config)]
    }

    fn begin_round(&mut self, config: RoundConfig) {
        let powers = match (config.game_mode, self.loadout) {
            (GameMode::PowerUps, Some(loadout)) => Some(PowerState::new(loadout, &config)),
            _ => None,
        };
        self.history = GuessHistory::new(powers.as_ref().is_some_and(|p| p.overclock()));
        self.powers = powers;
        self.config = Some(config);
        self.my_attempts = 0;
        self.opponent_attempts = None;
        self.rematch = Rematch::Idle;
        self.status.clear();
        self.set_state(GameState::Playing);
    }

    fn reset(&mut self, full: bool) {
        self.set_state(GameState::Lobby);
        self.config = None;
        self.history = GuessHistory::default();
        self.powers = None;
        self.my_attempts = 0;
        self.opponent_attempts = None;
        self.rematch = Rematch::Idle;
        self.status.clear();
        if full {
            self.room = None;
            self.role = None;
            self.opponent = None;
        }
    }

    fn set_state(&mut self, state: GameState) {
        if self.state != state {
            tracing::debug!("State {} -> {}", self.state, state);
            self.state = state;
        }
    }
}

/// Feedback line for a non-winning guess.
pub fn feedback(direction: Direction) -> &'static str {
    match direction {
        Direction::Higher => "TOO LOW! GO HIGHER!",
        Direction::Lower => "TOO HIGH! GO LOWER!",
        Direction::Correct => "GOT IT!",
    }
}
