//! The quiz minigame: a timed multiplayer trivia round. Players join a
//! lobby during a 20 second window; the game then runs 20 questions from
//! Open Trivia Database, awarding points by answer speed and converting the
//! final score into credits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::ledger::Bank;
use crate::store;
use crate::transport::{ChatTransport, GuildId, UserId};

const JOIN_WINDOW_SECS: i64 = 20;
const QUESTIONS_PER_GAME: u32 = 20;
const ANSWER_WINDOW_SECS: u64 = 10;

const LETTERS: [&str; 4] = ["a", "b", "c", "d"];
const COUNTDOWN: [&str; 10] = ["1⃣", "2⃣", "3⃣", "4⃣", "5⃣", "6⃣", "7⃣", "8⃣", "9⃣", "🔟"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    pub correct_answer: String,
    pub incorrect_answers: Vec<String>,
}

/// Where questions come from. The production source is Open Trivia
/// Database; tests script their own.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    async fn fetch(&self, guild: &GuildId, count: u32) -> Result<Vec<Question>>;
}

// ----- Open Trivia Database ----------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct GuildQuiz {
    #[serde(rename = "Token")]
    token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct QuizSave {
    #[serde(rename = "Servers")]
    guilds: HashMap<GuildId, GuildQuiz>,
}

#[derive(Debug, Deserialize)]
struct QuestionsResponse {
    response_code: u8,
    #[serde(default)]
    results: Vec<Question>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    response_code: u8,
    #[serde(default)]
    token: String,
}

/// Open Trivia Database client. Each guild keeps a session token (persisted
/// in the quiz save) so questions don't repeat until the pool is exhausted.
pub struct OpenTdbSource {
    client: reqwest::Client,
    path: std::path::PathBuf,
    save: std::sync::Mutex<QuizSave>,
}

impl OpenTdbSource {
    pub fn new(config: &Config) -> Result<Self> {
        let path = config.quiz_file();
        let save = store::load_or_default(&path, QuizSave::default)?;
        Ok(OpenTdbSource {
            client: reqwest::Client::new(),
            path,
            save: std::sync::Mutex::new(save),
        })
    }

    fn stored_token(&self, guild: &GuildId) -> String {
        let save = self.save.lock().unwrap();
        save.guilds.get(guild).map(|g| g.token.clone()).unwrap_or_default()
    }

    fn store_token(&self, guild: &GuildId, token: &str) -> Result<()> {
        let mut save = self.save.lock().unwrap();
        save.guilds.entry(guild.clone()).or_default().token = token.to_string();
        store::save(&self.path, &*save)
    }

    async fn token(&self, guild: &GuildId) -> Result<String> {
        let stored = self.stored_token(guild);
        if !stored.is_empty() {
            return Ok(stored);
        }
        let response: TokenResponse = self
            .client
            .get("https://opentdb.com/api_token.php")
            .query(&[("command", "request")])
            .send()
            .await
            .context("Failed to request a session token")?
            .json()
            .await
            .context("Failed to parse the token response")?;
        self.store_token(guild, &response.token)?;
        Ok(response.token)
    }

    async fn reset_token(&self, guild: &GuildId) -> Result<()> {
        let token = self.stored_token(guild);
        let response: TokenResponse = self
            .client
            .get("https://opentdb.com/api_token.php")
            .query(&[("command", "reset"), ("token", &token)])
            .send()
            .await
            .context("Failed to reset the session token")?
            .json()
            .await
            .context("Failed to parse the token reset response")?;
        if response.response_code != 0 {
            bail!("Token reset was unsuccessful. Response code from OTDB: {}", response.response_code);
        }
        Ok(())
    }
}

#[async_trait]
impl QuestionSource for OpenTdbSource {
    async fn fetch(&self, guild: &GuildId, count: u32) -> Result<Vec<Question>> {
        let category = rand::thread_rng().gen_range(9..=32);
        for _ in 0..3 {
            let token = self.token(guild).await?;
            let response: QuestionsResponse = self
                .client
                .get("https://opentdb.com/api.php")
                .query(&[
                    ("amount", count.to_string()),
                    ("category", category.to_string()),
                    ("token", token),
                ])
                .send()
                .await
                .context("Failed to fetch questions")?
                .json()
                .await
                .context("Failed to parse the questions response")?;

            match response.response_code {
                0 => {
                    return Ok(response
                        .results
                        .into_iter()
                        .map(|q| Question {
                            question: unescape(&q.question),
                            correct_answer: unescape(&q.correct_answer),
                            incorrect_answers: q.incorrect_answers.iter().map(|a| unescape(a)).collect(),
                        })
                        .collect());
                }
                1 | 2 => bail!(
                    "Question retrieval unsuccessful. Response code from OTDB: {}",
                    response.response_code
                ),
                // token exhausted: forget it and request a fresh one
                3 => self.store_token(guild, "")?,
                _ => self.reset_token(guild).await?,
            }
        }
        bail!("Failed to retrieve questions.")
    }
}

/// Decode the HTML entities OTDB escapes its text with.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..end];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()));
                match code.and_then(char::from_u32) {
                    Some(c) => out.push(c),
                    None => out.push_str(&tail[..=end]),
                }
            }
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

// ----- scoring ------------------------------------------------------------

/// Points for a correct answer: 1000 inside the first second, then a linear
/// falloff that reaches 500 at the 10 second limit.
pub fn score_for(elapsed_secs: f64) -> i64 {
    if elapsed_secs < 1.0 {
        1000
    } else {
        (1000.0 * (1.0 - elapsed_secs / 20.0)).round() as i64
    }
}

/// Final score to credits: 0.0002 * (score/100)^2.9, superlinear so winning
/// big games pays disproportionately.
pub fn credits_for(score: i64) -> i64 {
    (0.0002 * (score as f64 / 100.0).powf(2.9)).round() as i64
}

/// Lay out a question's four lettered choices and the index of the correct
/// one. True/false questions pin True to A and False to B.
fn layout_answers(question: &Question) -> (Vec<String>, usize) {
    if question.incorrect_answers.len() == 1 {
        let correct = if question.correct_answer.eq_ignore_ascii_case("true") { 0 } else { 1 };
        let answers = vec![
            "True".to_string(),
            "False".to_string(),
            String::new(),
            String::new(),
        ];
        return (answers, correct);
    }
    let mut answers: Vec<String> = std::iter::once(question.correct_answer.clone())
        .chain(question.incorrect_answers.iter().cloned())
        .collect();
    answers.shuffle(&mut rand::thread_rng());
    let correct = answers
        .iter()
        .position(|a| *a == question.correct_answer)
        .unwrap_or(0);
    (answers, correct)
}

// ----- the game -----------------------------------------------------------

struct Lobby {
    opened: DateTime<Utc>,
    started: bool,
    players: HashMap<UserId, i64>,
}

pub struct QuizGame {
    lobbies: HashMap<GuildId, Lobby>,
}

impl QuizGame {
    pub fn new() -> Self {
        QuizGame {
            lobbies: HashMap::new(),
        }
    }

    /// `quiz play`: open a lobby, or join the one filling up. Joining after
    /// the window closes is refused.
    pub async fn play(
        game: &Mutex<Self>,
        transport: &dyn ChatTransport,
        guild: &GuildId,
        user: &UserId,
    ) -> Result<()> {
        let mut g = game.lock().await;
        let Some(lobby) = g.lobbies.get_mut(guild) else {
            let mut players = HashMap::new();
            players.insert(user.clone(), 0);
            g.lobbies.insert(
                guild.clone(),
                Lobby {
                    opened: Utc::now(),
                    started: false,
                    players,
                },
            );
            return transport
                .send(
                    guild,
                    &format!(
                        "{} is starting a quiz game! It will start in {} seconds. \
                         Use `quiz play` to join.",
                        user, JOIN_WINDOW_SECS
                    ),
                )
                .await;
        };

        let since_open = (Utc::now() - lobby.opened).num_seconds();
        if lobby.players.contains_key(user) {
            transport.send(guild, "You are already in the game.").await
        } else if since_open > JOIN_WINDOW_SECS {
            transport.send(guild, "A quiz game is already underway.").await
        } else {
            lobby.players.insert(user.clone(), 0);
            transport.send(guild, &format!("{} joined the game.", user)).await
        }
    }

    /// Scan lobbies once a second; start games whose join window has closed,
    /// or disband them when nobody else joined.
    pub async fn start_loop(
        game: Arc<Mutex<Self>>,
        transport: Arc<dyn ChatTransport>,
        bank: Arc<dyn Bank>,
        source: Arc<dyn QuestionSource>,
    ) {
        loop {
            tokio::time::sleep(StdDuration::from_secs(1)).await;
            let expired: Vec<GuildId> = {
                let g = game.lock().await;
                g.lobbies
                    .iter()
                    .filter(|(_, lobby)| {
                        !lobby.started && (Utc::now() - lobby.opened).num_seconds() > JOIN_WINDOW_SECS
                    })
                    .map(|(guild, _)| guild.clone())
                    .collect()
            };
            for guild in expired {
                let mut g = game.lock().await;
                let Some(lobby) = g.lobbies.get_mut(&guild) else { continue };
                if lobby.players.len() > 1 {
                    lobby.started = true;
                    tokio::spawn(Self::run_game(
                        game.clone(),
                        transport.clone(),
                        bank.clone(),
                        source.clone(),
                        guild,
                    ));
                } else {
                    g.lobbies.remove(&guild);
                    if let Err(e) = transport.send(&guild, "Nobody else joined the quiz game.").await {
                        eprintln!("failed to disband quiz lobby in {}: {:#}", guild, e);
                    }
                }
            }
        }
    }

    pub async fn run_game(
        game: Arc<Mutex<Self>>,
        transport: Arc<dyn ChatTransport>,
        bank: Arc<dyn Bank>,
        source: Arc<dyn QuestionSource>,
        guild: GuildId,
    ) {
        if let Err(e) = Self::game_rounds(&game, transport.as_ref(), bank.as_ref(), source.as_ref(), &guild).await {
            eprintln!("quiz game failed in {}: {:#}", guild, e);
            let _ = transport
                .send(&guild, "The quiz game ran into a problem and had to stop.")
                .await;
        }
        game.lock().await.lobbies.remove(&guild);
    }

    async fn game_rounds(
        game: &Mutex<Self>,
        transport: &dyn ChatTransport,
        bank: &dyn Bank,
        source: &dyn QuestionSource,
        guild: &GuildId,
    ) -> Result<()> {
        let questions = source.fetch(guild, QUESTIONS_PER_GAME).await?;
        let players: Vec<UserId> = {
            let g = game.lock().await;
            g.lobbies
                .get(guild)
                .map(|lobby| lobby.players.keys().cloned().collect())
                .unwrap_or_default()
        };

        transport
            .send(
                guild,
                "Welcome to the quiz game!\n\
                 Remember to answer correctly as quickly as you can. You have 10s per question.\n\
                 The game will begin shortly.",
            )
            .await?;
        tokio::time::sleep(StdDuration::from_secs(4)).await;

        let mut scores: HashMap<UserId, i64> = players.iter().map(|p| (p.clone(), 0)).collect();

        for (index, question) in questions.iter().enumerate() {
            let (answers, correct) = layout_answers(question);

            let mut text = format!("**{}**\n", question.question);
            for (letter, answer) in ["A", "B", "C", "D"].iter().zip(&answers) {
                text.push_str(&format!("**{}.** {}\n", letter, answer));
            }

            // subscribe before asking so the fastest answer can't be missed
            let rx = transport.subscribe();
            transport.send(guild, &text).await?;
            transport.add_reaction(guild, "0⃣").await?;
            let asked = Instant::now();

            let answered = collect_answers(rx, transport, guild, &players, asked).await;

            for (player, (choice, elapsed)) in &answered {
                if answers[*choice] == question.correct_answer {
                    *scores.get_mut(player).unwrap() += score_for(elapsed.as_secs_f64());
                }
            }

            transport
                .send(
                    guild,
                    &format!(
                        "Correct answer: {}. {}",
                        LETTERS[correct].to_uppercase(),
                        answers[correct]
                    ),
                )
                .await?;
            transport
                .send(guild, &format!("Scoreboard:\n{}", scoreboard(&scores, 5)))
                .await?;

            tokio::time::sleep(StdDuration::from_secs(4)).await;
            if index + 1 < questions.len() {
                transport.send(guild, "Next question...").await?;
                tokio::time::sleep(StdDuration::from_secs(1)).await;
            }
        }

        // scores convert to credits on a steep curve
        let mut ranked: Vec<(&UserId, &i64)> = scores.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1));
        let mut text = String::from("Credits earned:\n```\n");
        for (rank, (player, score)) in ranked.iter().enumerate() {
            let credits = credits_for(**score);
            if !bank.account_exists(player) {
                bank.open_account(player)?;
            }
            bank.deposit(player, credits)?;
            text.push_str(&format!("{} {:<20} {:>6}\n", rank + 1, player, credits));
        }
        text.push_str("```");
        transport.send(guild, &text).await?;
        Ok(())
    }
}

impl Default for QuizGame {
    fn default() -> Self {
        Self::new()
    }
}

/// Gather each player's first a/b/c/d reply within the 10 second window,
/// posting a countdown reaction every second. Ends early once everyone has
/// answered.
async fn collect_answers(
    mut rx: broadcast::Receiver<crate::transport::Incoming>,
    transport: &dyn ChatTransport,
    guild: &GuildId,
    players: &[UserId],
    asked: Instant,
) -> HashMap<UserId, (usize, StdDuration)> {
    let mut answered: HashMap<UserId, (usize, StdDuration)> = HashMap::new();
    for tick in 0..ANSWER_WINDOW_SECS {
        if answered.len() == players.len() {
            break;
        }
        let tick_end = asked + StdDuration::from_secs(tick + 1);
        loop {
            let remaining = tick_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let message = match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(message)) => message,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                _ => break,
            };
            if message.guild != *guild
                || !players.contains(&message.author)
                || answered.contains_key(&message.author)
            {
                continue;
            }
            let choice = message.content.trim().to_lowercase();
            if let Some(idx) = LETTERS.iter().position(|l| *l == choice) {
                answered.insert(message.author, (idx, asked.elapsed()));
            }
        }
        if let Err(e) = transport.add_reaction(guild, COUNTDOWN[tick as usize]).await {
            eprintln!("failed to post countdown in {}: {:#}", guild, e);
        }
    }
    answered
}

fn scoreboard(scores: &HashMap<UserId, i64>, limit: usize) -> String {
    let mut ranked: Vec<(&UserId, &i64)> = scores.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1));
    let mut board = String::from("```\n");
    for (rank, (player, score)) in ranked.iter().take(limit).enumerate() {
        board.push_str(&format!("{} {:<20} {:>6}\n", rank + 1, player, score));
    }
    board.push_str("```");
    board
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::MemoryBank;
    use crate::transport::testing::RecordingTransport;

    struct ScriptedSource {
        questions: Vec<Question>,
    }

    #[async_trait]
    impl QuestionSource for ScriptedSource {
        async fn fetch(&self, _guild: &GuildId, _count: u32) -> Result<Vec<Question>> {
            Ok(self.questions.clone())
        }
    }

    fn multiple_choice(question: &str, correct: &str, wrong: [&str; 3]) -> Question {
        Question {
            question: question.to_string(),
            correct_answer: correct.to_string(),
            incorrect_answers: wrong.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_score_falloff() {
        assert_eq!(score_for(0.4), 1000);
        assert_eq!(score_for(1.0), 950);
        assert_eq!(score_for(10.0), 500);
        // slower beats absent, faster beats slower
        assert!(score_for(2.0) > score_for(9.0));
    }

    #[test]
    fn test_credits_curve_is_superlinear() {
        assert_eq!(credits_for(0), 0);
        let low = credits_for(5_000);
        let high = credits_for(10_000);
        assert!(high > low * 2);
    }

    #[test]
    fn test_true_false_layout_is_pinned() {
        let question = Question {
            question: "Is water wet?".to_string(),
            correct_answer: "False".to_string(),
            incorrect_answers: vec!["True".to_string()],
        };
        let (answers, correct) = layout_answers(&question);
        assert_eq!(answers, vec!["True", "False", "", ""]);
        assert_eq!(correct, 1);
    }

    #[test]
    fn test_multiple_choice_layout_keeps_the_correct_answer() {
        let question = multiple_choice("2+2?", "4", ["3", "5", "22"]);
        for _ in 0..20 {
            let (answers, correct) = layout_answers(&question);
            assert_eq!(answers.len(), 4);
            assert_eq!(answers[correct], "4");
        }
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(unescape("&quot;quoted&quot;"), "\"quoted\"");
        assert_eq!(unescape("caf&#233;"), "café");
        assert_eq!(unescape("caf&#xE9;"), "café");
        assert_eq!(unescape("no entities"), "no entities");
        assert_eq!(unescape("&bogus;"), "&bogus;");
    }

    #[tokio::test]
    async fn test_lobby_join_rules() {
        let game = Mutex::new(QuizGame::new());
        let transport = RecordingTransport::new();
        let guild = "g".to_string();

        QuizGame::play(&game, &transport, &guild, &"alice".to_string())
            .await
            .unwrap();
        QuizGame::play(&game, &transport, &guild, &"bob".to_string())
            .await
            .unwrap();
        // joining twice is refused
        QuizGame::play(&game, &transport, &guild, &"alice".to_string())
            .await
            .unwrap();

        let sent = transport.sent_texts();
        assert!(sent[0].contains("starting a quiz game"));
        assert!(sent[1].contains("joined the game"));
        assert!(sent[2].contains("already in the game"));
        assert_eq!(game.lock().await.lobbies[&guild].players.len(), 2);
    }

    #[tokio::test]
    async fn test_late_join_is_refused() {
        let game = Mutex::new(QuizGame::new());
        let transport = RecordingTransport::new();
        let guild = "g".to_string();

        QuizGame::play(&game, &transport, &guild, &"alice".to_string())
            .await
            .unwrap();
        game.lock().await.lobbies.get_mut(&guild).unwrap().opened =
            Utc::now() - chrono::Duration::seconds(JOIN_WINDOW_SECS + 1);

        QuizGame::play(&game, &transport, &guild, &"bob".to_string())
            .await
            .unwrap();
        assert!(transport
            .sent_texts()
            .last()
            .unwrap()
            .contains("already underway"));
        assert_eq!(game.lock().await.lobbies[&guild].players.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_game_runs_to_completion_and_pays_out() {
        let game = Arc::new(Mutex::new(QuizGame::new()));
        let transport: Arc<RecordingTransport> = Arc::new(RecordingTransport::new());
        let bank = Arc::new(MemoryBank::with_accounts(&[("alice", 0), ("bob", 0)]));
        let source = Arc::new(ScriptedSource {
            questions: vec![
                multiple_choice("2+2?", "4", ["3", "5", "22"]),
                multiple_choice("Capital of France?", "Paris", ["Rome", "Lyon", "Bern"]),
            ],
        });
        {
            let mut g = game.lock().await;
            let mut players = HashMap::new();
            players.insert("alice".to_string(), 0);
            players.insert("bob".to_string(), 0);
            g.lobbies.insert(
                "g".to_string(),
                Lobby {
                    opened: Utc::now(),
                    started: true,
                    players,
                },
            );
        }

        QuizGame::run_game(
            game.clone(),
            transport.clone(),
            bank.clone(),
            source,
            "g".to_string(),
        )
        .await;

        let sent = transport.sent_texts();
        assert!(sent.iter().any(|t| t.contains("Welcome to the quiz game")));
        assert_eq!(sent.iter().filter(|t| t.contains("Correct answer:")).count(), 2);
        assert!(sent.last().unwrap().contains("Credits earned"));
        // nobody answered: zero credits, lobby cleaned up
        assert_eq!(bank.balance(&"alice".to_string()), 0);
        assert!(game.lock().await.lobbies.is_empty());
    }
}
