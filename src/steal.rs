//! The steal minigame: players pick one of three upgrade paths, level them
//! up with credits, and rob each other on an hourly cooldown. Every attempt
//! opens with a timed keypad challenge; the outcome of the robbery itself is
//! decided by the attacker/defender path matchup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use chrono::{NaiveDateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::ledger::Bank;
use crate::parrot::ParrotGame;
use crate::scheduler;
use crate::selector;
use crate::store::{self, Migration};
use crate::transport::{ChatTransport, GuildId, UserId};

pub const SCHEMA_VERSION: &str = "1.2";

const COOLDOWN_SECS: i64 = 3600;
const KEYPAD_DIGITS: usize = 13;
const KEYPAD_TIMEOUT: StdDuration = StdDuration::from_secs(15);
const MENU_TIMEOUT: StdDuration = StdDuration::from_secs(60);
const PROMPT_TIMEOUT: StdDuration = StdDuration::from_secs(20);
const MAX_LEVEL: u32 = 99;
const INSURANCE_PAYOUT: i64 = 1000;
const DEGRADE_PERCENT: f64 = 33.0;
const DEGRADE_LEVELS: u32 = 5;
const REPORT_HOUR: u32 = 2;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradePath {
    #[serde(rename = "Elite Raid")]
    EliteRaid,
    #[serde(rename = "Advanced Security")]
    AdvancedSecurity,
    #[serde(rename = "Blackmarket Finances")]
    BlackmarketFinances,
}

pub const PATHS: [UpgradePath; 3] = [
    UpgradePath::EliteRaid,
    UpgradePath::AdvancedSecurity,
    UpgradePath::BlackmarketFinances,
];

impl fmt::Display for UpgradePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradePath::EliteRaid => "Elite Raid",
            UpgradePath::AdvancedSecurity => "Advanced Security",
            UpgradePath::BlackmarketFinances => "Blackmarket Finances",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    #[serde(rename = "Active")]
    pub active: UpgradePath,
    #[serde(rename = "Elite Raid")]
    pub elite_raid: u32,
    #[serde(rename = "Advanced Security")]
    pub advanced_security: u32,
    #[serde(rename = "Blackmarket Finances")]
    pub blackmarket_finances: u32,
    /// Epoch seconds of the last steal attempt.
    #[serde(rename = "StealTime")]
    pub steal_time: f64,
    /// Epoch seconds of the last path activation.
    #[serde(rename = "ActivateTime")]
    pub activate_time: f64,
}

impl Default for PlayerState {
    fn default() -> Self {
        PlayerState {
            active: UpgradePath::AdvancedSecurity,
            elite_raid: 0,
            advanced_security: 0,
            blackmarket_finances: 0,
            steal_time: 0.0,
            activate_time: 0.0,
        }
    }
}

impl PlayerState {
    pub fn level(&self, path: UpgradePath) -> u32 {
        match path {
            UpgradePath::EliteRaid => self.elite_raid,
            UpgradePath::AdvancedSecurity => self.advanced_security,
            UpgradePath::BlackmarketFinances => self.blackmarket_finances,
        }
    }

    pub fn level_mut(&mut self, path: UpgradePath) -> &mut u32 {
        match path {
            UpgradePath::EliteRaid => &mut self.elite_raid,
            UpgradePath::AdvancedSecurity => &mut self.advanced_security,
            UpgradePath::BlackmarketFinances => &mut self.blackmarket_finances,
        }
    }

    fn sap(&mut self, path: UpgradePath) {
        let level = self.level_mut(path);
        *level = level.saturating_sub(DEGRADE_LEVELS);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuildSteal {
    #[serde(rename = "Players")]
    pub players: HashMap<UserId, PlayerState>,
    /// Reset daily by the report loop.
    #[serde(rename = "TheftCount")]
    pub theft_count: u64,
    #[serde(rename = "Thieves")]
    pub thieves: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StealGlobal {
    #[serde(rename = "CreditsGivenTime")]
    pub credits_given_time: String,
    #[serde(rename = "Version")]
    pub version: String,
}

impl Default for StealGlobal {
    fn default() -> Self {
        StealGlobal {
            credits_given_time: "1970-01-01T00:00:00.0".to_string(),
            version: SCHEMA_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StealSave {
    #[serde(rename = "Servers")]
    pub guilds: HashMap<GuildId, GuildSteal>,
    #[serde(rename = "Global")]
    pub global: StealGlobal,
}

// ----- the matchup table --------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Attacker,
    Defender,
}

/// After-the-fact level sapping: when the `gate` side's level in `gate_path`
/// is at least `gate_level`, a 33% roll knocks 5 levels off the `target`
/// side's `target_path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Degrade {
    pub gate: Side,
    pub gate_path: UpgradePath,
    pub gate_level: u32,
    pub target: Side,
    pub target_path: UpgradePath,
}

/// What one attacker-path vs defender-path pairing does. Probabilities and
/// side effects live here as data; the resolution code just reads them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchupRule {
    pub success_percent: f64,
    /// Maxed-out Advanced Security halves the success chance.
    pub halved_at_max_security: bool,
    /// Successful steals use the Elite Raid payout instead of the regular one.
    pub elite_payout: bool,
    /// On failure, the defender's security level is their percent chance of
    /// an insurance payout.
    pub insurance: bool,
    /// On failure, a defender at or above this security level is told who
    /// attacked them. Elite Raid attackers are immune to the cameras.
    pub reveal_at: Option<u32>,
    pub degrade: Option<Degrade>,
}

use UpgradePath::{AdvancedSecurity as AS, BlackmarketFinances as BF, EliteRaid as ER};

pub const MATCHUPS: [((UpgradePath, UpgradePath), MatchupRule); 9] = [
    ((ER, ER), MatchupRule {
        success_percent: 66.0,
        halved_at_max_security: false,
        elite_payout: true,
        insurance: false,
        reveal_at: None,
        degrade: None,
    }),
    ((ER, AS), MatchupRule {
        success_percent: 33.0,
        halved_at_max_security: true,
        elite_payout: true,
        insurance: true,
        reveal_at: None,
        degrade: Some(Degrade {
            gate: Side::Attacker,
            gate_path: ER,
            gate_level: 66,
            target: Side::Defender,
            target_path: AS,
        }),
    }),
    ((ER, BF), MatchupRule {
        success_percent: 66.0,
        halved_at_max_security: false,
        elite_payout: true,
        insurance: false,
        reveal_at: None,
        degrade: Some(Degrade {
            gate: Side::Defender,
            gate_path: BF,
            gate_level: 66,
            target: Side::Attacker,
            target_path: ER,
        }),
    }),
    ((AS, ER), MatchupRule {
        success_percent: 33.0,
        halved_at_max_security: false,
        elite_payout: false,
        insurance: false,
        reveal_at: None,
        degrade: None,
    }),
    ((AS, AS), MatchupRule {
        success_percent: 33.0,
        halved_at_max_security: true,
        elite_payout: false,
        insurance: true,
        reveal_at: Some(33),
        degrade: None,
    }),
    ((AS, BF), MatchupRule {
        success_percent: 33.0,
        halved_at_max_security: false,
        elite_payout: false,
        insurance: false,
        reveal_at: None,
        degrade: None,
    }),
    ((BF, ER), MatchupRule {
        success_percent: 50.0,
        halved_at_max_security: false,
        elite_payout: false,
        insurance: false,
        reveal_at: None,
        degrade: None,
    }),
    ((BF, AS), MatchupRule {
        success_percent: 33.0,
        halved_at_max_security: true,
        elite_payout: false,
        insurance: true,
        reveal_at: Some(33),
        degrade: Some(Degrade {
            gate: Side::Defender,
            gate_path: AS,
            gate_level: 66,
            target: Side::Attacker,
            target_path: BF,
        }),
    }),
    ((BF, BF), MatchupRule {
        success_percent: 50.0,
        halved_at_max_security: false,
        elite_payout: false,
        insurance: false,
        reveal_at: None,
        degrade: None,
    }),
];

pub fn matchup(attacker: UpgradePath, defender: UpgradePath) -> MatchupRule {
    MATCHUPS
        .iter()
        .find(|((a, d), _)| *a == attacker && *d == defender)
        .map(|(_, rule)| *rule)
        .expect("matchup table covers every pairing")
}

// ----- cooldowns ----------------------------------------------------------

/// Strictly more than the cooldown must have elapsed.
pub fn off_cooldown(last: f64, now: f64) -> bool {
    (now - last).round() as i64 > COOLDOWN_SECS
}

/// H:MM:SS until the cooldown ends.
pub fn time_left_str(last: f64, now: f64) -> String {
    let remaining = (COOLDOWN_SECS - (now - last).round() as i64).max(0);
    format!(
        "{}:{:02}:{:02}",
        remaining / 3600,
        remaining % 3600 / 60,
        remaining % 60
    )
}

fn now_secs() -> f64 {
    Utc::now().timestamp() as f64
}

// ----- upgrade pricing ----------------------------------------------------

/// Cost of going from `current` up `lvls` levels. Maxed-out Blackmarket
/// Finances halves everything before rounding.
pub fn upgrade_cost(current: u32, lvls: u32, discounted: bool) -> i64 {
    let raw = 5.0 * ((current + lvls) as f64).powf(1.933)
        - 5.0 * (current as f64).powf(1.933);
    let cost = if discounted { raw / 2.0 } else { raw };
    cost.round() as i64
}

/// The most levels `balance` can buy, mirroring the advertised "maximum you
/// can afford" fallback. Returns 0 when even one level is out of reach.
pub fn affordable_levels(current: u32, balance: i64, discounted: bool) -> u32 {
    let mut lvls = 1;
    while upgrade_cost(current, lvls, discounted) < balance && current + lvls <= MAX_LEVEL {
        lvls += 1;
    }
    lvls - 1
}

pub struct StealGame {
    config: Config,
    pub save: StealSave,
    menu_users: HashSet<UserId>,
}

impl StealGame {
    pub fn new(config: &Config) -> Result<Self> {
        let save: StealSave = store::load_migrated(
            &config.steal_file(),
            StealSave::default,
            save_version,
            MIGRATIONS,
        )?;
        Ok(StealGame {
            config: config.clone(),
            save,
            menu_users: HashSet::new(),
        })
    }

    fn persist(&self) -> Result<()> {
        store::save(&self.config.steal_file(), &self.save)
    }

    fn ensure_guild(&mut self, guild: &GuildId) {
        self.save.guilds.entry(guild.clone()).or_default();
    }

    /// Returns true when the player record was just created.
    fn ensure_player(&mut self, guild: &GuildId, user: &UserId) -> Result<bool> {
        self.ensure_guild(guild);
        let record = self.save.guilds.get_mut(guild).unwrap();
        if record.players.contains_key(user) {
            return Ok(false);
        }
        record.players.insert(user.clone(), PlayerState::default());
        self.persist()?;
        Ok(true)
    }

    fn player(&self, guild: &GuildId, user: &UserId) -> Result<&PlayerState> {
        self.save
            .guilds
            .get(guild)
            .and_then(|g| g.players.get(user))
            .ok_or_else(|| anyhow!("no steal record for {} in {}", user, guild))
    }

    fn player_mut(&mut self, guild: &GuildId, user: &UserId) -> Result<&mut PlayerState> {
        self.save
            .guilds
            .get_mut(guild)
            .and_then(|g| g.players.get_mut(user))
            .ok_or_else(|| anyhow!("no steal record for {} in {}", user, guild))
    }

    fn record_theft(&mut self, guild: &GuildId, thief: &UserId) {
        if let Some(record) = self.save.guilds.get_mut(guild) {
            record.theft_count += 1;
            if !record.thieves.contains(thief) {
                record.thieves.push(thief.clone());
            }
        }
    }

    // ----- menus ----------------------------------------------------------

    /// `steal`: everything in this game runs through one DM-driven menu.
    /// Only one menu per user at a time.
    pub async fn menu(
        game: &Mutex<Self>,
        parrot: &Mutex<ParrotGame>,
        transport: &dyn ChatTransport,
        bank: &dyn Bank,
        guild: &GuildId,
        user: &UserId,
    ) -> Result<()> {
        {
            let mut g = game.lock().await;
            g.ensure_guild(guild);

            if !bank.account_exists(user) {
                return transport
                    .send(guild, "You don't have a bank account. Use `bank register` to open one, then try `steal` again.")
                    .await;
            }
            if !g.menu_users.insert(user.clone()) {
                return transport
                    .send_dm(user, "The command is already running for you here.")
                    .await;
            }
            if g.ensure_player(guild, user)? {
                transport.send(guild, "Check for a direct message from me.").await?;
                transport
                    .send_dm(
                        user,
                        "Welcome to the world of crime!\n\
                         There are three upgrade paths you can choose from. You can upgrade in \
                         multiple paths at once, but only one upgrade path can be active at once. \
                         Activating an upgrade path means turning on the benefits that path \
                         provides (and turning off the benefits your previous path provided).\n\n\
                         Right now, your active path is Advanced Security.",
                    )
                    .await?;
            }
        }

        let result = Self::main_menu(game, parrot, transport, bank, guild, user).await;
        game.lock().await.menu_users.remove(user);
        result
    }

    async fn main_menu(
        game: &Mutex<Self>,
        parrot: &Mutex<ParrotGame>,
        transport: &dyn ChatTransport,
        bank: &dyn Bank,
        guild: &GuildId,
        user: &UserId,
    ) -> Result<()> {
        loop {
            transport
                .send_dm(
                    user,
                    "What would you like to do?\n\
                     1. Steal from someone\n\
                     2. Buy an upgrade\n\
                     3. Activate an upgrade path\n\
                     Reply with the number of your choice, or with anything else to cancel.",
                )
                .await?;

            let Some(choice) = transport.await_reply(user, MENU_TIMEOUT).await else {
                break;
            };

            let keep_going = match choice.trim() {
                "1" => {
                    let (last, now) = {
                        let g = game.lock().await;
                        (g.player(guild, user)?.steal_time, now_secs())
                    };
                    if off_cooldown(last, now) {
                        Self::steal_menu(game, parrot, transport, bank, guild, user).await?
                    } else {
                        transport
                            .send_dm(
                                user,
                                &format!("Steal is on cooldown. Time left: {}", time_left_str(last, now)),
                            )
                            .await?;
                        true
                    }
                }
                "2" => Self::upgrade_menu(game, transport, bank, guild, user).await?,
                "3" => {
                    let (last, now) = {
                        let g = game.lock().await;
                        (g.player(guild, user)?.activate_time, now_secs())
                    };
                    if off_cooldown(last, now) {
                        Self::activate_menu(game, transport, guild, user).await?
                    } else {
                        transport
                            .send_dm(
                                user,
                                &format!("Activate is on cooldown. Time left: {}", time_left_str(last, now)),
                            )
                            .await?;
                        true
                    }
                }
                _ => false,
            };

            if !keep_going {
                break;
            }
            tokio::time::sleep(StdDuration::from_secs(2)).await;
        }

        transport.send_dm(user, "Goodbye!").await
    }

    /// Returns whether the main menu should loop again.
    async fn steal_menu(
        game: &Mutex<Self>,
        parrot: &Mutex<ParrotGame>,
        transport: &dyn ChatTransport,
        bank: &dyn Bank,
        guild: &GuildId,
        user: &UserId,
    ) -> Result<bool> {
        transport
            .send_dm(user, "Who do you want to steal from? Reply with their user id.")
            .await?;
        let Some(reply) = transport.await_reply(user, MENU_TIMEOUT).await else {
            return Ok(false);
        };
        let target: UserId = reply.trim().to_string();

        if target == *user {
            transport.send_dm(user, "You can't steal from yourself.").await?;
            return Ok(true);
        }
        if !bank.account_exists(&target) {
            transport
                .send_dm(user, "That person doesn't have a bank account.")
                .await?;
            return Ok(true);
        }

        game.lock().await.ensure_player(guild, &target)?;

        Self::steal_credits(game, parrot, transport, bank, guild, user, &target).await?;

        let mut g = game.lock().await;
        g.player_mut(guild, user)?.steal_time = now_secs();
        g.persist()?;
        Ok(true)
    }

    async fn upgrade_menu(
        game: &Mutex<Self>,
        transport: &dyn ChatTransport,
        bank: &dyn Bank,
        guild: &GuildId,
        user: &UserId,
    ) -> Result<bool> {
        let player = game.lock().await.player(guild, user)?.clone();

        let mut message = String::from(
            "What would you like to upgrade? Reply with the number of your choice, \
             or with anything else to cancel.\n",
        );
        for (num, path) in PATHS.iter().enumerate() {
            message.push_str(&format!("{}. {} (lvl {})", num + 1, path, player.level(*path)));
            if *path == player.active {
                message.push_str(" *");
            }
            message.push('\n');
        }
        message.push_str("* currently active");
        transport.send_dm(user, &message).await?;

        let Some(reply) = transport.await_reply(user, MENU_TIMEOUT).await else {
            return Ok(false);
        };
        let path = match reply.trim() {
            "1" => PATHS[0],
            "2" => PATHS[1],
            "3" => PATHS[2],
            _ => {
                transport.send_dm(user, "Upgrade cancelled.").await?;
                return Ok(true);
            }
        };

        let current = player.level(path);
        if current == MAX_LEVEL {
            transport.send_dm(user, "That path is already max level.").await?;
            return Ok(true);
        }

        transport
            .send_dm(user, "How many levels would you like to upgrade? Respond with a non-number to cancel.")
            .await?;
        let Some(reply) = transport.await_reply(user, PROMPT_TIMEOUT).await else {
            return Ok(false);
        };
        let Ok(mut lvls) = reply.trim().parse::<u32>() else {
            transport.send_dm(user, "Upgrade cancelled.").await?;
            return Ok(true);
        };
        if lvls == 0 {
            transport.send_dm(user, "Upgrade cancelled.").await?;
            return Ok(true);
        }

        if current + lvls > MAX_LEVEL {
            lvls = MAX_LEVEL - current;
            transport
                .send_dm(
                    user,
                    &format!("You cannot upgrade past lvl 99. You will only upgrade {} levels.", lvls),
                )
                .await?;
        }
        let discounted = player.blackmarket_finances == MAX_LEVEL;
        let mut cost = upgrade_cost(current, lvls, discounted);

        transport
            .send_dm(
                user,
                &format!(
                    "This will cost {} credits. If you cannot afford the cost, the maximum \
                     number of levels you can afford will be upgraded. Reply with \"yes\" to \
                     confirm, or anything else to cancel.",
                    cost
                ),
            )
            .await?;
        let Some(reply) = transport.await_reply(user, PROMPT_TIMEOUT).await else {
            return Ok(false);
        };
        if reply.trim().to_lowercase() != "yes" {
            transport.send_dm(user, "Upgrade cancelled.").await?;
            return Ok(true);
        }

        if !bank.can_spend(user, cost) {
            lvls = affordable_levels(current, bank.balance(user), discounted);
            if lvls == 0 {
                transport
                    .send_dm(user, "You cannot afford to upgrade this path at all.")
                    .await?;
                return Ok(true);
            }
            cost = upgrade_cost(current, lvls, discounted);
        }

        bank.withdraw(user, cost)?;
        let mut g = game.lock().await;
        *g.player_mut(guild, user)?.level_mut(path) += lvls;
        g.persist()?;

        transport.send_dm(user, "Upgrade complete.").await?;
        Ok(true)
    }

    async fn activate_menu(
        game: &Mutex<Self>,
        transport: &dyn ChatTransport,
        guild: &GuildId,
        user: &UserId,
    ) -> Result<bool> {
        let player = game.lock().await.player(guild, user)?.clone();

        let inactives: Vec<UpgradePath> =
            PATHS.iter().copied().filter(|p| *p != player.active).collect();
        let mut message = format!(
            "{} is currently active. Which path do you want to activate?\n",
            player.active
        );
        for (num, path) in inactives.iter().enumerate() {
            message.push_str(&format!("{}. {} (lvl {})\n", num + 1, path, player.level(*path)));
        }
        transport.send_dm(user, &message).await?;

        let Some(reply) = transport.await_reply(user, MENU_TIMEOUT).await else {
            return Ok(false);
        };
        let path = match reply.trim() {
            "1" => inactives[0],
            "2" => inactives[1],
            _ => {
                transport.send_dm(user, "Activation cancelled.").await?;
                return Ok(true);
            }
        };

        let mut g = game.lock().await;
        let player = g.player_mut(guild, user)?;
        player.active = path;
        player.activate_time = now_secs();
        g.persist()?;

        transport.send_dm(user, "Activation complete.").await?;
        Ok(true)
    }

    // ----- the robbery ----------------------------------------------------

    /// 13 digits, 15 seconds, as many tries as fit in the window.
    async fn keypad_challenge(transport: &dyn ChatTransport, user: &UserId) -> Result<bool> {
        transport
            .send_dm(
                user,
                "Quick! You have 15 seconds to unlock the door's keypad to get inside! \
                 Type the code below without the dashes. Keep trying until you're in or \
                 time is up.",
            )
            .await?;
        tokio::time::sleep(StdDuration::from_secs(3)).await;

        let digits: Vec<String> = {
            let mut rng = rand::thread_rng();
            (0..KEYPAD_DIGITS).map(|_| rng.gen_range(0..=9).to_string()).collect()
        };
        let code = digits.join("");
        transport.send_dm(user, &digits.join("-")).await?;

        let deadline = Instant::now() + KEYPAD_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match transport.await_reply(user, remaining).await {
                Some(reply) if reply.trim() == code => return Ok(true),
                Some(_) => continue,
                None => return Ok(false),
            }
        }
    }

    async fn steal_credits(
        game: &Mutex<Self>,
        parrot: &Mutex<ParrotGame>,
        transport: &dyn ChatTransport,
        bank: &dyn Bank,
        guild: &GuildId,
        attacker: &UserId,
        target: &UserId,
    ) -> Result<()> {
        let rule = {
            let g = game.lock().await;
            matchup(g.player(guild, attacker)?.active, g.player(guild, target)?.active)
        };

        if !Self::keypad_challenge(transport, attacker).await? {
            transport.send_dm(attacker, "You failed!").await?;
            let g = game.lock().await;
            let defender = g.player(guild, target)?;
            if defender.active == AS && selector::percent_roll(defender.advanced_security as f64) {
                bank.deposit(target, INSURANCE_PAYOUT)?;
            }
            return Ok(());
        }
        transport.send_dm(attacker, "You're in!").await?;
        tokio::time::sleep(StdDuration::from_secs(1)).await;

        let mut g = game.lock().await;
        let player = g.player(guild, attacker)?.clone();
        let defender = g.player(guild, target)?.clone();

        let mut success_chance = rule.success_percent;
        if rule.halved_at_max_security && defender.advanced_security == MAX_LEVEL {
            success_chance /= 2.0;
        }

        if selector::percent_roll(success_chance) {
            let boosted = parrot.lock().await.heist_boost_available(guild, attacker, true)?;
            if rule.elite_payout {
                g.elite_payout(transport, bank, guild, attacker, target, &player, boosted)
                    .await?;
            } else {
                g.regular_payout(transport, bank, guild, attacker, target, boosted)
                    .await?;
            }
        } else {
            let failure = [
                "Right as you're about to open the safe, you hear footsteps. You and your team flee the scene.",
                "You pull hard on the door, making a loud clang, but it seems to be jammed. Maybe there's some kind of hidden mechanism, but guards may have heard you. You scram and live to see another day.",
                "Something about this operation smells fishy. It might be a trap. You call it off.",
                "There's nothing in the safe! Maybe its owner knew you were coming?",
                "What in the world!? Two armed guards jump out at you. You and the team run like the wind and barely get out with your heads on your necks.",
            ];
            let idx = rand::thread_rng().gen_range(0..failure.len());
            transport
                .send_dm(attacker, &format!("{}\n**Steal failed.**", failure[idx]))
                .await?;

            if rule.insurance && selector::percent_roll(defender.advanced_security as f64) {
                bank.deposit(target, INSURANCE_PAYOUT)?;
            }
            if let Some(threshold) = rule.reveal_at {
                if defender.advanced_security >= threshold {
                    transport
                        .send_dm(
                            target,
                            &format!(
                                "{}, who had {} active, was spotted by your guard stealing \
                                 credits from your bank safe! Your guard was unable to catch \
                                 the fiend before they fled.",
                                attacker, player.active
                            ),
                        )
                        .await?;
                }
            }
        }

        // level sapping applies whether or not the steal landed
        if let Some(degrade) = rule.degrade {
            let gate_state = match degrade.gate {
                Side::Attacker => &player,
                Side::Defender => &defender,
            };
            if gate_state.level(degrade.gate_path) >= degrade.gate_level
                && selector::percent_roll(DEGRADE_PERCENT)
            {
                let target_user = match degrade.target {
                    Side::Attacker => attacker,
                    Side::Defender => target,
                };
                g.player_mut(guild, target_user)?.sap(degrade.target_path);
            }
        }

        g.persist()
    }

    async fn elite_payout(
        &mut self,
        transport: &dyn ChatTransport,
        bank: &dyn Bank,
        guild: &GuildId,
        attacker: &UserId,
        target: &UserId,
        player: &PlayerState,
        boosted: bool,
    ) -> Result<()> {
        // maxed-out raiders occasionally sweep the whole account at ransom
        if player.elite_raid == MAX_LEVEL && selector::percent_roll(10.0) {
            let amount = (bank.balance(target) as f64 * 1.1).round() as i64;
            bank.set_balance(target, 0)?;
            bank.deposit(attacker, amount)?;
            transport
                .send_dm(
                    attacker,
                    &format!(
                        "You captured a good friend of {0}'s as hostage and demanded ransom, \
                         which was promptly paid. You graciously accepted every credit {0} had, \
                         plus some that the poor soul took out on a loan to meet your demands. \
                         All in all, you earned yourself {1} credits.",
                        target, amount
                    ),
                )
                .await?;
            self.record_theft(guild, attacker);
            return Ok(());
        }

        let mut amount = selector::nested_uniform(2000.0);
        if selector::percent_roll(player.elite_raid as f64) {
            amount *= 2;
        }
        if player.elite_raid >= 33 {
            amount += (bank.balance(target) as f64 * 0.1).round() as i64;
        }
        if boosted {
            amount *= 2;
        }
        let amount = amount.min(bank.balance(target));
        bank.transfer(target, attacker, amount)?;
        transport
            .send_dm(
                attacker,
                &format!("Mission accomplished! You stole {} credits from {}!", amount, target),
            )
            .await?;
        if boosted {
            transport
                .send_dm(attacker, "The parrot's inside knowledge paid off! Your haul was doubled.")
                .await?;
        }
        self.record_theft(guild, attacker);
        Ok(())
    }

    async fn regular_payout(
        &mut self,
        transport: &dyn ChatTransport,
        bank: &dyn Bank,
        guild: &GuildId,
        attacker: &UserId,
        target: &UserId,
        boosted: bool,
    ) -> Result<()> {
        let mut amount = selector::nested_uniform(2000.0);
        if boosted {
            amount *= 2;
        }
        let amount = amount.min(bank.balance(target));
        bank.transfer(target, attacker, amount)?;
        transport
            .send_dm(
                attacker,
                &format!("Mission accomplished! You stole {} credits from {}!", amount, target),
            )
            .await?;
        if boosted {
            transport
                .send_dm(attacker, "The parrot's inside knowledge paid off! Your haul was doubled.")
                .await?;
        }
        self.record_theft(guild, attacker);
        Ok(())
    }

    // ----- background loops -----------------------------------------------

    /// Hourly income for active Blackmarket Finances players, paid at a
    /// random minute and second each hour. The last-given timestamp guards
    /// against double payment within one hour across restarts.
    pub async fn credit_drip(game: Arc<Mutex<Self>>, bank: Arc<dyn Bank>) {
        loop {
            let now = Utc::now();
            let already_given = {
                let g = game.lock().await;
                same_hour(&g.save.global.credits_given_time, now)
            };
            if already_given {
                let (minute, second) = {
                    let mut rng = rand::thread_rng();
                    // minimum second 1: landing exactly on the hour boundary
                    // after a slightly short sleep could pay twice
                    (rng.gen_range(0..=59), rng.gen_range(1..=59))
                };
                let next = scheduler::next_hour(now)
                    + chrono::Duration::minutes(minute)
                    + chrono::Duration::seconds(second);
                scheduler::sleep_until(next).await;
            }

            let mut g = game.lock().await;
            for record in g.save.guilds.values() {
                for (user, player) in &record.players {
                    if player.active == BF && player.blackmarket_finances > 0 {
                        if !bank.account_exists(user) {
                            continue;
                        }
                        if let Err(e) = bank.deposit(user, player.blackmarket_finances as i64) {
                            eprintln!("credit drip failed for {}: {:#}", user, e);
                        }
                    }
                }
            }
            g.save.global.credits_given_time = Utc::now().format(TIME_FORMAT).to_string();
            if let Err(e) = g.persist() {
                eprintln!("failed to save after credit drip: {:#}", e);
            }
        }
    }

    /// Daily theft bulletin at 02:00 UTC, then the counters reset.
    pub async fn daily_report(game: Arc<Mutex<Self>>, transport: Arc<dyn ChatTransport>) {
        loop {
            let wake = scheduler::next_daily(Utc::now(), REPORT_HOUR, 0);
            scheduler::sleep_until(wake).await;

            let mut g = game.lock().await;
            let guild_ids: Vec<GuildId> = g.save.guilds.keys().cloned().collect();
            for guild in guild_ids {
                let Some(record) = g.save.guilds.get(&guild) else { continue };
                let message = format!(
                    "Announcement from the Royal Navy: \n\
                     Today there were {} counts of theft perpetrated by {} members of this \
                     server. The Royal Navy cautions all members to remain vigilant in these \
                     lawless times.",
                    record.theft_count,
                    record.thieves.len()
                );
                if let Err(e) = transport.send(&guild, &message).await {
                    eprintln!("failed to send daily report to {}: {:#}", guild, e);
                }
                if let Some(record) = g.save.guilds.get_mut(&guild) {
                    record.theft_count = 0;
                    record.thieves.clear();
                }
            }
            if let Err(e) = g.persist() {
                eprintln!("failed to save after daily report: {:#}", e);
            }
        }
    }
}

/// Whether the recorded drip timestamp falls in the same UTC hour as `now`.
fn same_hour(recorded: &str, now: chrono::DateTime<Utc>) -> bool {
    let Ok(parsed) = NaiveDateTime::parse_from_str(recorded, TIME_FORMAT) else {
        return false;
    };
    let now = now.naive_utc();
    parsed.date() == now.date() && parsed.format("%H").to_string() == now.format("%H").to_string()
}

// ----- save-file migrations ----------------------------------------------

fn save_version(doc: &Value) -> Option<String> {
    doc.get("Global")?
        .get("Version")?
        .as_str()
        .map(String::from)
}

/// The steal timestamp used to be called LatestSteal; activation had no
/// cooldown yet.
fn migrate_untagged(mut doc: Value) -> Result<Value> {
    if let Some(guilds) = doc["Servers"].as_object_mut() {
        for record in guilds.values_mut() {
            if let Some(players) = record["Players"].as_object_mut() {
                for player in players.values_mut() {
                    let latest = player["LatestSteal"].clone();
                    player["StealTime"] = latest;
                    player.as_object_mut().map(|p| p.remove("LatestSteal"));
                    player["ActivateTime"] = json!(0);
                }
            }
        }
    }
    doc["Global"]["Version"] = json!("1.1");
    Ok(doc)
}

/// Path names used to be stored abbreviated.
fn migrate_v1_1(mut doc: Value) -> Result<Value> {
    let expand = [("AS", "Advanced Security"), ("ER", "Elite Raid"), ("BF", "Blackmarket Finances")];
    if let Some(guilds) = doc["Servers"].as_object_mut() {
        for record in guilds.values_mut() {
            if let Some(players) = record["Players"].as_object_mut() {
                for player in players.values_mut() {
                    if let Some(active) = player["Active"].as_str() {
                        if let Some((_, full)) = expand.iter().find(|(short, _)| *short == active) {
                            player["Active"] = json!(full);
                        }
                    }
                    for (short, full) in expand {
                        if let Some(level) = player.as_object_mut().and_then(|p| p.remove(short)) {
                            player[full] = level;
                        }
                    }
                }
            }
        }
    }
    doc["Global"]["Version"] = json!("1.2");
    Ok(doc)
}

pub const MIGRATIONS: &[Migration] = &[(None, migrate_untagged), (Some("1.1"), migrate_v1_1)];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::temp_config;
    use crate::ledger::testing::MemoryBank;
    use crate::transport::testing::RecordingTransport;

    #[test]
    fn test_cooldown_boundary() {
        // one second short of the hour: still on cooldown
        assert!(!off_cooldown(0.0, 3599.0));
        // exactly one hour: still on cooldown (strictly greater required)
        assert!(!off_cooldown(0.0, 3600.0));
        assert!(off_cooldown(0.0, 3601.0));
    }

    #[test]
    fn test_time_left_formatting() {
        assert_eq!(time_left_str(0.0, 3599.0), "0:00:01");
        assert_eq!(time_left_str(0.0, 0.0), "1:00:00");
        assert_eq!(time_left_str(0.0, 5000.0), "0:00:00");
    }

    #[test]
    fn test_matchup_table_covers_every_pairing() {
        for attacker in PATHS {
            for defender in PATHS {
                let rule = matchup(attacker, defender);
                assert!(rule.success_percent > 0.0);
            }
        }
    }

    #[test]
    fn test_matchup_table_details() {
        // raiders are immune to the cameras but not the insurance
        let er_as = matchup(ER, AS);
        assert!(er_as.insurance);
        assert!(er_as.reveal_at.is_none());
        assert!(er_as.halved_at_max_security);
        assert!(er_as.elite_payout);

        let as_as = matchup(AS, AS);
        assert_eq!(as_as.reveal_at, Some(33));
        assert!(!as_as.elite_payout);

        let bf_bf = matchup(BF, BF);
        assert_eq!(bf_bf.success_percent, 50.0);
        assert!(bf_bf.degrade.is_none());

        // financiers get their raiding gear sapped by entrenched financiers
        let er_bf = matchup(ER, BF);
        let degrade = er_bf.degrade.unwrap();
        assert_eq!(degrade.gate, Side::Defender);
        assert_eq!(degrade.target, Side::Attacker);
        assert_eq!(degrade.target_path, ER);
    }

    #[test]
    fn test_upgrade_cost_math() {
        assert_eq!(upgrade_cost(0, 1, false), 5);
        // costs grow superlinearly with level
        assert!(upgrade_cost(50, 1, false) > upgrade_cost(10, 1, false));
        // the discount halves before rounding
        let full = 5.0 * 10f64.powf(1.933);
        assert_eq!(upgrade_cost(0, 10, true), (full / 2.0).round() as i64);
    }

    #[test]
    fn test_affordable_levels() {
        // 0 -> 1 costs 5: a balance of 5 affords nothing (strict less-than),
        // 6 affords one level
        assert_eq!(affordable_levels(0, 5, false), 0);
        assert_eq!(affordable_levels(0, 6, false), 1);
        assert!(affordable_levels(0, 1_000_000_000, false) <= MAX_LEVEL);
    }

    #[test]
    fn test_sap_floors_at_zero() {
        let mut player = PlayerState::default();
        player.advanced_security = 3;
        player.sap(AS);
        assert_eq!(player.advanced_security, 0);
        player.elite_raid = 40;
        player.sap(ER);
        assert_eq!(player.elite_raid, 35);
    }

    #[test]
    fn test_migration_chain_from_untagged() {
        let legacy = json!({
            "Servers": {
                "g": {
                    "Players": {
                        "alice": {
                            "Active": "ER",
                            "ER": 12,
                            "AS": 3,
                            "BF": 0,
                            "LatestSteal": 12345.5
                        }
                    },
                    "TheftCount": 2,
                    "Thieves": ["alice"]
                }
            },
            "Global": { "CreditsGivenTime": "1970-01-01T00:00:00.0" }
        });
        let migrated = store::migrate_chain(legacy, save_version, MIGRATIONS).unwrap();
        assert_eq!(save_version(&migrated).as_deref(), Some(SCHEMA_VERSION));

        let save: StealSave = serde_json::from_value(migrated).unwrap();
        let player = &save.guilds["g"].players["alice"];
        assert_eq!(player.active, ER);
        assert_eq!(player.elite_raid, 12);
        assert_eq!(player.advanced_security, 3);
        assert_eq!(player.steal_time, 12345.5);
        assert_eq!(player.activate_time, 0.0);
    }

    #[test]
    fn test_same_hour_guard() {
        let now = Utc::now();
        assert!(same_hour(&now.format(TIME_FORMAT).to_string(), now));
        let earlier = now - chrono::Duration::hours(2);
        assert!(!same_hour(&earlier.format(TIME_FORMAT).to_string(), now));
        assert!(!same_hour("not a timestamp", now));
    }

    #[tokio::test]
    async fn test_menu_requires_bank_account() {
        let config = temp_config("steal-noaccount");
        let game = Mutex::new(StealGame::new(&config).unwrap());
        let parrot = Mutex::new(ParrotGame::new(&config).unwrap());
        let transport = RecordingTransport::new();
        let bank = MemoryBank::new();

        StealGame::menu(&game, &parrot, &transport, &bank, &"g".to_string(), &"alice".to_string())
            .await
            .unwrap();
        assert!(transport
            .sent_texts()
            .iter()
            .any(|t| t.contains("bank account")));
    }

    #[tokio::test]
    async fn test_menu_guards_against_reentry() {
        let config = temp_config("steal-reentry");
        let game = Mutex::new(StealGame::new(&config).unwrap());
        let parrot = Mutex::new(ParrotGame::new(&config).unwrap());
        let bank = MemoryBank::with_accounts(&[("alice", 100)]);
        let guild = "g".to_string();
        let user = "alice".to_string();

        game.lock().await.menu_users.insert(user.clone());

        let transport = RecordingTransport::new();
        StealGame::menu(&game, &parrot, &transport, &bank, &guild, &user)
            .await
            .unwrap();
        assert!(transport
            .dm_texts()
            .iter()
            .any(|t| t.contains("already running")));
        // the guard entry is not cleared by the refused attempt
        assert!(game.lock().await.menu_users.contains(&user));
    }

    #[tokio::test]
    async fn test_upgrade_flow_debits_and_levels() {
        let config = temp_config("steal-upgrade");
        let game = Mutex::new(StealGame::new(&config).unwrap());
        let guild = "g".to_string();
        let user = "alice".to_string();
        game.lock().await.ensure_player(&guild, &user).unwrap();

        let bank = MemoryBank::with_accounts(&[("alice", 1000)]);
        // pick Elite Raid, 10 levels, confirm
        let transport = RecordingTransport::with_replies(&["1", "10", "yes"]);
        let keep_going = StealGame::upgrade_menu(&game, &transport, &bank, &guild, &user)
            .await
            .unwrap();
        assert!(keep_going);

        let g = game.lock().await;
        assert_eq!(g.player(&guild, &user).unwrap().elite_raid, 10);
        assert_eq!(bank.balance(&user), 1000 - upgrade_cost(0, 10, false));
    }

    #[tokio::test]
    async fn test_activate_switches_path_and_starts_cooldown() {
        let config = temp_config("steal-activate");
        let game = Mutex::new(StealGame::new(&config).unwrap());
        let guild = "g".to_string();
        let user = "alice".to_string();
        game.lock().await.ensure_player(&guild, &user).unwrap();

        // default active is Advanced Security; option 1 is Elite Raid
        let transport = RecordingTransport::with_replies(&["1"]);
        StealGame::activate_menu(&game, &transport, &guild, &user)
            .await
            .unwrap();

        let g = game.lock().await;
        let player = g.player(&guild, &user).unwrap();
        assert_eq!(player.active, ER);
        assert!(player.activate_time > 0.0);
        assert!(!off_cooldown(player.activate_time, now_secs()));
    }

    #[test]
    fn test_theft_report_data_dedups_thieves() {
        let config = temp_config("steal-report");
        let mut game = StealGame::new(&config).unwrap();
        let guild = "g".to_string();
        game.ensure_guild(&guild);
        game.record_theft(&guild, &"alice".to_string());
        game.record_theft(&guild, &"alice".to_string());
        game.record_theft(&guild, &"bob".to_string());

        let record = &game.save.guilds[&guild];
        assert_eq!(record.theft_count, 3);
        assert_eq!(record.thieves.len(), 2);
    }
}
