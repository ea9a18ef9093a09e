//! Terminal client: wires a [`SessionService`] to a [`GameSession`] and
//! turns stdin lines into guesses and commands.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Settings;
use crate::error::{GuessError, SessionError};
use crate::game::{self, GameSession, Outbound, Outcome, Rematch, Turn};
use crate::powers::{Activation, ActivePower, Heat, Loadout, PassivePower};
use crate::session::{SessionService, Subscription};
use crate::transport::Connector;
use crate::types::*;

const GLITCH_CHARS: &[u8] = b"#%&@$*?!";
const HOT_SEAT_USAGE: &str = "PREFIX EACH LINE WITH THE SEAT: 1 <GUESS|/COMMAND> OR 2 <GUESS|/COMMAND>";

pub struct Driver<C: Connector> {
    session: SessionService<C>,
    game: GameSession,
    inbox: Subscription,
    rng: StdRng,
    settings: Settings,
    /// Printed before every line, to tell hot-seat players apart.
    label: String,
}

impl<C: Connector> Driver<C> {
    pub fn new(connector: C, settings: Settings) -> Self {
        let session = SessionService::new(connector, settings.clone());
        let inbox = session.subscribe();
        Self {
            session,
            game: GameSession::new(),
            inbox,
            rng: StdRng::from_os_rng(),
            settings,
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = format!("{} ", label);
        self
    }

    pub fn game(&self) -> &GameSession {
        &self.game
    }

    pub fn set_loadout(&mut self, loadout: Loadout) {
        self.game.set_loadout(loadout);
    }

    /// Opens a fresh room as host and returns its code.
    pub async fn create(&mut self, player: Player, mode: GameMode) -> Result<RoomCode, SessionError> {
        let room = self.session.generate_room_code();
        self.game.create_room(room.clone(), player.clone(), mode);
        match self.session.host(room.clone(), &player).await {
            Ok(()) => {
                self.game.hosted();
                Ok(room)
            }
            Err(e) => {
                tracing::error!("Failed to host {}: {}", room, e);
                self.game.connection_failed();
                Err(e)
            }
        }
    }

    /// Joins `room`. On failure the status shows the error for a while,
    /// then the game drops back to the lobby.
    pub async fn join(&mut self, room: RoomCode, player: Player) -> Result<(), SessionError> {
        self.game.begin_join(room.clone(), player.clone());
        match self.session.join_room(room.clone(), &player).await {
            Ok(()) => {
                self.game.joined();
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to join {}: {}", room, e);
                self.game.connection_failed();
                tokio::time::sleep(self.settings.join_failure_reset()).await;
                self.game.exit();
                Err(e)
            }
        }
    }

    /// Carries out the state machine's requests, in order.
    async fn dispatch(&mut self, outbound: Vec<Outbound>) -> Result<(), SessionError> {
        for action in outbound {
            match action {
                Outbound::StartGame(config) => self.session.start_game(config)?,
                Outbound::Finished(attempts) => self.session.send_finished(attempts)?,
                Outbound::Restart => self.session.restart_game()?,
                Outbound::RequestRematch { requester_name } => self.session.request_rematch(&requester_name)?,
                Outbound::AcceptRematch => self.session.accept_rematch()?,
                Outbound::DeclineRematch => self.session.decline_rematch()?,
                Outbound::Effect { effect, duration } => self.session.send_power_up_effect(effect, duration)?,
                Outbound::Disconnect => self.session.disconnect().await,
            }
        }
        Ok(())
    }

    /// Applies a message from the opponent and returns lines to show.
    pub async fn on_message(&mut self, message: Message) -> Result<Vec<String>, SessionError> {
        let before = self.game.state();
        let effect = match &message {
            Message::PowerUpEffect(p) => Some(p.effect),
            _ => None,
        };
        let now = Instant::now();
        let outbound = self.game.handle_message(message, &mut self.rng, now);
        self.dispatch(outbound).await?;

        let mut lines = Vec::new();
        if let (Some(effect), Some(powers)) = (effect, self.game.powers()) {
            let landed = match effect {
                Effect::Glitch => powers.is_glitched(now),
                Effect::Freeze => powers.is_frozen(now),
            };
            lines.push(match (landed, effect) {
                (true, Effect::Glitch) => "SCREEN GLITCHED!".to_string(),
                (true, Effect::Freeze) => "INPUT FROZEN!".to_string(),
                (false, _) => "FIREWALL BLOCKED AN ATTACK".to_string(),
            });
        }
        lines.extend(self.transition_lines(before));
        Ok(lines)
    }

    /// Handles one line typed by the player.
    pub async fn on_input(&mut self, line: &str) -> Result<Vec<String>, SessionError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let before = self.game.state();
        let mut lines = Vec::new();

        let outbound = match line.strip_prefix('/') {
            None => match self.game.submit_guess(line, Instant::now()) {
                Ok(turn) => {
                    lines.extend(describe_turn(&turn));
                    turn.outbound
                }
                Err(e) => {
                    lines.push(describe_guess_error(&e));
                    Vec::new()
                }
            },
            Some(command) => {
                let mut words = command.split_whitespace();
                match words.next().unwrap_or_default() {
                    "power" => match self.game.activate_power() {
                        Ok((activation, outbound)) => {
                            lines.push(describe_activation(activation));
                            outbound
                        }
                        Err(e) => {
                            lines.push(e.to_string().to_uppercase());
                            Vec::new()
                        }
                    },
                    "rematch" => self.game.request_rematch(),
                    "accept" | "decline" if !matches!(self.game.rematch(), Rematch::Incoming { .. }) => {
                        lines.push("NO REMATCH REQUEST TO ANSWER".to_string());
                        Vec::new()
                    }
                    "accept" => self.game.accept_rematch(&mut self.rng),
                    "decline" => self.game.decline_rematch(),
                    "restart" => self.game.restart(),
                    "exit" => self.game.exit(),
                    "rejoin" => {
                        lines.extend(self.rejoin().await?);
                        Vec::new()
                    }
                    "loadout" => {
                        lines.push(self.choose_loadout(words.next(), words.next()));
                        Vec::new()
                    }
                    other => {
                        lines.push(format!("UNKNOWN COMMAND: /{}", other));
                        Vec::new()
                    }
                }
            }
        };
        self.dispatch(outbound).await?;
        lines.extend(self.transition_lines(before));
        Ok(lines)
    }

    /// Re-sends a JOIN after a restart left a joiner in the lobby.
    async fn rejoin(&mut self) -> Result<Vec<String>, SessionError> {
        let (Some(room), Some(player)) = (self.game.room().cloned(), self.game.player().cloned()) else {
            return Ok(vec!["NOT IN A ROOM".to_string()]);
        };
        if self.game.role() != Some(Role::Joiner) || self.game.state() != GameState::Lobby {
            return Ok(vec!["ONLY A JOINER IN THE LOBBY CAN REJOIN".to_string()]);
        }
        if let Err(e) = self.join(room, player).await {
            return Ok(vec![format!("REJOIN FAILED: {}", e).to_uppercase()]);
        }
        Ok(Vec::new())
    }

    fn choose_loadout(&mut self, active: Option<&str>, passive: Option<&str>) -> String {
        let (Some(active), Some(passive)) = (active, passive) else {
            return "USAGE: /loadout ACTIVE PASSIVE".to_string();
        };
        match (active.parse::<ActivePower>(), passive.parse::<PassivePower>()) {
            (Ok(active), Ok(passive)) => {
                self.game.set_loadout(Loadout { active, passive });
                format!("LOADOUT: {:?} + {:?} (FROM NEXT ROUND)", active, passive).to_uppercase()
            }
            (Err(e), _) | (_, Err(e)) => e.to_uppercase(),
        }
    }

    /// Lines announcing a state change since `before`, plus the status.
    fn transition_lines(&self, before: GameState) -> Vec<String> {
        let mut lines = Vec::new();
        let state = self.game.state();
        if state != before {
            match state {
                GameState::Playing => {
                    if let Some(config) = self.game.config() {
                        let opponent = self.game.opponent().map(|o| o.name.as_str()).unwrap_or("OPPONENT");
                        lines.push(format!(
                            "VS {}: GUESS A NUMBER BETWEEN {} AND {}",
                            opponent, config.min_range, config.max_range
                        ));
                    }
                    if let Some(powers) = self.game.powers() {
                        let loadout = powers.loadout();
                        lines.push(format!("ABILITIES: {:?} + {:?}", loadout.active, loadout.passive).to_uppercase());
                    }
                }
                GameState::GameOver => {
                    let theirs = self.game.opponent_attempts().unwrap_or_default();
                    let verdict = match self.game.outcome() {
                        Some(Outcome::Victory) => "VICTORY!",
                        Some(Outcome::Draw) => "DRAW!",
                        Some(Outcome::Defeat) | None => "DEFEAT!",
                    };
                    lines.push(format!("{} {} VS {}", verdict, self.game.my_attempts(), theirs));
                    let guesses: Vec<String> = self
                        .game
                        .history()
                        .records()
                        .iter()
                        .map(|r| r.value.to_string())
                        .collect();
                    lines.push(format!("YOUR GUESSES: {}", guesses.join(", ")));
                    lines.push("/rematch OR /exit".to_string());
                }
                GameState::Lobby => lines.push("BACK IN THE LOBBY".to_string()),
                GameState::WaitingResult => {}
            }
        }
        if !self.game.status().is_empty() {
            lines.push(self.game.status().to_string());
        }
        lines
    }

    /// Scrambles `line` while the screen is glitched.
    fn display(&mut self, line: &str) -> String {
        let glitched = self.game.powers().is_some_and(|p| p.is_glitched(Instant::now()));
        if !glitched {
            return line.to_string();
        }
        line.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() && self.rng.random_bool(0.5) {
                    char::from(GLITCH_CHARS[self.rng.random_range(0..GLITCH_CHARS.len())])
                } else {
                    c
                }
            })
            .collect()
    }

    fn print(&mut self, lines: Vec<String>) {
        for line in lines {
            let shown = self.display(&line);
            println!("{}{}", self.label, shown);
        }
    }

    fn show(&mut self, result: Result<Vec<String>, SessionError>) {
        match result {
            Ok(lines) => self.print(lines),
            Err(e) => {
                tracing::warn!("Action failed: {}", e);
                self.print(vec![e.to_string().to_uppercase()]);
            }
        }
    }

    /// Reads stdin and the room until the player leaves.
    pub async fn run(mut self) {
        let mut input = BufReader::new(tokio::io::stdin()).lines();
        let status = self.transition_lines(self.game.state());
        self.print(status);

        loop {
            tokio::select! {
                line = input.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!("Failed to read input: {}", e);
                            break;
                        }
                    };
                    let result = self.on_input(&line).await;
                    self.show(result);
                }
                Some(message) = self.inbox.recv() => {
                    let result = self.on_message(message).await;
                    self.show(result);
                }
            }
            if !self.check_link() {
                break;
            }
        }

        self.close().await;
    }

    /// Drops to the lobby if the link went away. Returns whether the player
    /// is still in a room.
    fn check_link(&mut self) -> bool {
        if !self.session.is_connected() && self.game.room().is_some() {
            self.print(vec!["CONNECTION LOST".to_string()]);
            self.game.exit();
        }
        self.game.room().is_some()
    }

    async fn close(self) {
        let Self { mut session, inbox, .. } = self;
        inbox.unsubscribe();
        session.disconnect().await;
    }
}

/// Splits a hot-seat line into the seat it is for and the input itself.
fn seat_line(line: &str) -> Option<(Role, &str)> {
    let (seat, input) = line.trim().split_once(char::is_whitespace)?;
    let role = match seat {
        "1" => Role::Host,
        "2" => Role::Joiner,
        _ => return None,
    };
    Some((role, input.trim()))
}

/// Plays both seats of one room from a single terminal. The host is seat 1,
/// the joiner seat 2. Ends once either seat leaves the room.
pub async fn run_hot_seat<C: Connector>(mut host: Driver<C>, mut joiner: Driver<C>) {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    for seat in [&mut host, &mut joiner] {
        let status = seat.transition_lines(seat.game.state());
        seat.print(status);
    }
    println!("{}", HOT_SEAT_USAGE);

    while host.game().room().is_some() && joiner.game().room().is_some() {
        tokio::select! {
            line = input.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Failed to read input: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match seat_line(&line) {
                    Some((Role::Host, rest)) => {
                        let result = host.on_input(rest).await;
                        host.show(result);
                    }
                    Some((Role::Joiner, rest)) => {
                        let result = joiner.on_input(rest).await;
                        joiner.show(result);
                    }
                    None => println!("{}", HOT_SEAT_USAGE),
                }
            }
            Some(message) = host.inbox.recv() => {
                let result = host.on_message(message).await;
                host.show(result);
            }
            Some(message) = joiner.inbox.recv() => {
                let result = joiner.on_message(message).await;
                joiner.show(result);
            }
        }
        host.check_link();
        joiner.check_link();
    }

    host.close().await;
    joiner.close().await;
}

fn describe_turn(turn: &Turn) -> Vec<String> {
    let mut lines: Vec<String> = turn
        .skipped
        .iter()
        .map(|v| format!("ALREADY GUESSED {}", v))
        .collect();
    for record in &turn.records {
        let free = if record.free_attempt { " (FREE)" } else { "" };
        lines.push(format!("{}: {}{}", record.value, game::feedback(record.direction), free));
    }
    if let Some(attempts) = turn.finished {
        lines.push(format!("SOLVED IN {} ATTEMPTS", attempts));
    }
    if let Some(heat) = turn.heat {
        lines.push(format!("HEAT: {}", describe_heat(heat)));
    }
    lines
}

fn describe_heat(heat: Heat) -> &'static str {
    match heat {
        Heat::Burning => "BURNING",
        Heat::Hot => "HOT",
        Heat::Warm => "WARM",
        Heat::Cold => "COLD",
    }
}

fn describe_guess_error(e: &GuessError) -> String {
    match e {
        GuessError::NotANumber => "ENTER A NUMBER".to_string(),
        other => other.to_string().to_uppercase(),
    }
}

fn describe_activation(activation: Activation) -> String {
    match activation {
        Activation::Narrowed(range) => format!("SCAN: TARGET IS BETWEEN {} AND {}", range.min, range.max),
        Activation::Inflict { effect, duration } => {
            format!("SENT {:?} FOR {}S", effect, duration.as_secs()).to_uppercase()
        }
        Activation::DoubleShotArmed => "DOUBLE SHOT READY: ENTER TWO GUESSES, COMMA SEPARATED".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::transport::LocalBus;

    async fn pump<C: Connector>(driver: &mut Driver<C>) -> Vec<String> {
        let message = tokio::time::timeout(Duration::from_secs(2), driver.inbox.recv())
            .await
            .expect("timed out waiting for message")
            .expect("inbox closed");
        driver.on_message(message).await.unwrap()
    }

    async fn connected_pair(mode: GameMode) -> (Driver<LocalBus>, Driver<LocalBus>) {
        let bus = LocalBus::new();
        let mut host = Driver::new(bus.clone(), Settings::default());
        let mut joiner = Driver::new(bus, Settings::default());
        if mode == GameMode::PowerUps {
            let loadout = Loadout {
                active: ActivePower::Freeze,
                passive: PassivePower::Thermal,
            };
            host.set_loadout(loadout);
            joiner.set_loadout(loadout);
        }

        let room = host.create(Player::new("ana", "🐸").unwrap(), mode).await.unwrap();
        assert_eq!(host.game().status(), format!("CODE: {}", room));
        joiner.join(room, Player::new("bob", "🐱").unwrap()).await.unwrap();
        assert_eq!(joiner.game().status(), "WAITING FOR HOST TO START...");

        // JOIN reaches the host, START_GAME reaches the joiner.
        pump(&mut host).await;
        let lines = pump(&mut joiner).await;
        assert!(lines[0].starts_with("VS ANA: GUESS A NUMBER BETWEEN"));
        (host, joiner)
    }

    async fn solve<C: Connector>(driver: &mut Driver<C>) -> Vec<String> {
        let target = driver.game().config().unwrap().target_number;
        driver.on_input(&target.to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn both_drivers_play_the_same_round() {
        let (host, joiner) = connected_pair(GameMode::Classic).await;
        assert_eq!(host.game().state(), GameState::Playing);
        assert_eq!(joiner.game().state(), GameState::Playing);
        assert_eq!(host.game().config(), joiner.game().config());
    }

    #[tokio::test]
    async fn full_round_ends_with_outcomes() {
        let (mut host, mut joiner) = connected_pair(GameMode::Classic).await;
        let min = host.game().config().unwrap().min_range;

        let lines = host.on_input(&min.to_string()).await.unwrap();
        assert_eq!(lines, vec![format!("{}: TOO LOW! GO HIGHER!", min)]);
        let lines = host.on_input(&min.to_string()).await.unwrap();
        assert_eq!(lines, vec![format!("ALREADY GUESSED {}", min)]);

        let lines = solve(&mut host).await;
        assert!(lines.contains(&"SOLVED IN 2 ATTEMPTS".to_string()));
        assert_eq!(host.game().state(), GameState::WaitingResult);

        pump(&mut joiner).await;
        let lines = solve(&mut joiner).await;
        assert!(lines.contains(&"VICTORY! 1 VS 2".to_string()));

        let lines = pump(&mut host).await;
        assert!(lines.contains(&"DEFEAT! 2 VS 1".to_string()));
    }

    #[tokio::test]
    async fn declined_rematch_ends_both_sessions() {
        let (mut host, mut joiner) = connected_pair(GameMode::Classic).await;
        solve(&mut host).await;
        solve(&mut joiner).await;
        pump(&mut host).await;
        pump(&mut joiner).await;

        host.on_input("/rematch").await.unwrap();
        let lines = pump(&mut joiner).await;
        assert!(lines.contains(&"ANA WANTS A REMATCH".to_string()));

        joiner.on_input("/decline").await.unwrap();
        assert!(!joiner.session.is_connected());
        pump(&mut host).await;
        assert_eq!(host.game().room(), None);
        assert!(!host.session.is_connected());
    }

    #[tokio::test]
    async fn accepted_rematch_starts_new_round() {
        let (mut host, mut joiner) = connected_pair(GameMode::Classic).await;
        solve(&mut host).await;
        solve(&mut joiner).await;
        pump(&mut host).await;
        pump(&mut joiner).await;

        joiner.on_input("/rematch").await.unwrap();
        pump(&mut host).await;
        let lines = host.on_input("/accept").await.unwrap();
        assert!(lines[0].starts_with("VS BOB"));
        pump(&mut joiner).await;
        assert_eq!(joiner.game().state(), GameState::Playing);
        assert_eq!(host.game().config(), joiner.game().config());
    }

    #[tokio::test]
    async fn freeze_reaches_opponent() {
        let (mut host, mut joiner) = connected_pair(GameMode::PowerUps).await;
        let lines = host.on_input("/power").await.unwrap();
        assert_eq!(lines, vec!["SENT FREEZE FOR 3S".to_string()]);

        let lines = pump(&mut joiner).await;
        assert_eq!(lines, vec!["INPUT FROZEN!".to_string()]);
        let lines = joiner.on_input("1").await.unwrap();
        assert_eq!(lines, vec!["INPUT FROZEN BY OPPONENT".to_string()]);

        let lines = host.on_input("/power").await.unwrap();
        assert_eq!(lines, vec!["ABILITY ALREADY USED THIS ROUND".to_string()]);
    }

    #[tokio::test]
    async fn commands_validate_input() {
        let (mut host, _joiner) = connected_pair(GameMode::Classic).await;
        assert_eq!(host.on_input("/power").await.unwrap(), vec!["POWER-UPS ARE NOT ENABLED FOR THIS ROUND"]);
        assert_eq!(host.on_input("/fly").await.unwrap(), vec!["UNKNOWN COMMAND: /fly"]);
        assert_eq!(host.on_input("/loadout scan").await.unwrap(), vec!["USAGE: /loadout ACTIVE PASSIVE"]);
        assert_eq!(
            host.on_input("/loadout scan firewall").await.unwrap(),
            vec!["LOADOUT: BINARYSCAN + FIREWALL (FROM NEXT ROUND)"]
        );
        assert_eq!(host.on_input("seven").await.unwrap(), vec!["ENTER A NUMBER"]);
        assert!(host.on_input("   ").await.unwrap().is_empty());
        assert_eq!(host.on_input("/accept").await.unwrap(), vec!["NO REMATCH REQUEST TO ANSWER"]);
    }

    #[tokio::test]
    async fn restart_then_rejoin() {
        let (mut host, mut joiner) = connected_pair(GameMode::Classic).await;
        let lines = host.on_input("/restart").await.unwrap();
        assert_eq!(lines, vec!["BACK IN THE LOBBY"]);
        pump(&mut joiner).await;
        assert_eq!(joiner.game().state(), GameState::Lobby);
        assert!(joiner.session.is_connected());

        joiner.on_input("/rejoin").await.unwrap();
        pump(&mut host).await;
        pump(&mut joiner).await;
        assert_eq!(host.game().state(), GameState::Playing);
        assert_eq!(joiner.game().state(), GameState::Playing);
    }

    #[test]
    fn hot_seat_lines_pick_a_seat() {
        assert_eq!(seat_line("1 42"), Some((Role::Host, "42")));
        assert_eq!(seat_line("  2   /power "), Some((Role::Joiner, "/power")));
        assert_eq!(seat_line("2 /loadout scan firewall"), Some((Role::Joiner, "/loadout scan firewall")));
        assert_eq!(seat_line("3 42"), None);
        assert_eq!(seat_line("42"), None);
        assert_eq!(seat_line("1"), None);
    }

    #[tokio::test]
    async fn hot_seat_routes_to_each_seat() {
        let (host, joiner) = connected_pair(GameMode::Classic).await;
        let (mut host, mut joiner) = (host.with_label("[1]"), joiner.with_label("[2]"));
        let min = host.game().config().unwrap().min_range;

        let line = format!("2 {}", min);
        let (seat, input) = seat_line(&line).unwrap();
        assert_eq!(seat, Role::Joiner);
        let lines = joiner.on_input(input).await.unwrap();
        assert_eq!(lines, vec![format!("{}: TOO LOW! GO HIGHER!", min)]);
        assert_eq!(joiner.game().history().records().len(), 1);
        assert!(host.game().history().records().is_empty());

        let (_, input) = seat_line("1 /exit").unwrap();
        host.on_input(input).await.unwrap();
        assert!(!host.check_link());
        assert!(joiner.check_link());
        host.close().await;
    }

    #[tokio::test]
    async fn failed_join_returns_to_lobby() {
        let settings = Settings {
            join_failure_reset_ms: 10,
            ..Settings::default()
        };
        let mut driver = Driver::new(FailingConnector, settings);
        let room = RoomCode::parse("AB3XZ").unwrap();
        let result = driver.join(room, Player::new("bob", "🐱").unwrap()).await;
        assert!(result.is_err());
        assert_eq!(driver.game().state(), GameState::Lobby);
        assert_eq!(driver.game().room(), None);
    }

    struct FailingConnector;

    #[async_trait::async_trait]
    impl Connector for FailingConnector {
        async fn connect(
            &self,
            _topic: &str,
            _role: Role,
        ) -> Result<Box<dyn crate::transport::Transport>, crate::error::TransportError> {
            Err(crate::error::TransportError::Closed)
        }
    }
}
