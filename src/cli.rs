use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::ledger::{Bank, JsonBank};
use crate::parrot::ParrotGame;
use crate::quiz::{OpenTdbSource, QuizGame};
use crate::steal::StealGame;
use crate::store;
use crate::transport::{ChatTransport, ConsoleTransport, Incoming};

/// Run the interactive shell: every stdin line is published as a chat
/// message in `guild` from `user`, and recognized commands are dispatched
/// on top of that.
pub async fn handle_run(data_dir: Option<PathBuf>, guild: String, user: String) -> Result<()> {
    let config = Config::new(data_dir)?;

    let console = Arc::new(ConsoleTransport::new());
    let transport: Arc<dyn ChatTransport> = console.clone();
    let bank: Arc<dyn Bank> = Arc::new(JsonBank::new(config.bank_file())?);

    let parrot = Arc::new(Mutex::new(ParrotGame::new(&config)?));
    let steal = Arc::new(Mutex::new(StealGame::new(&config)?));
    let quiz = Arc::new(Mutex::new(QuizGame::new()));
    let source = Arc::new(OpenTdbSource::new(&config)?);

    tokio::spawn(ParrotGame::run(parrot.clone(), transport.clone(), bank.clone()));
    tokio::spawn(StealGame::credit_drip(steal.clone(), bank.clone()));
    tokio::spawn(StealGame::daily_report(steal.clone(), transport.clone()));
    tokio::spawn(QuizGame::start_loop(
        quiz.clone(),
        transport.clone(),
        bank.clone(),
        source,
    ));

    println!("{}", "guildgames shell".green().bold());
    println!("Acting as {} in guild {}. Type `help` for commands, `quit` to exit.\n", user.cyan(), guild.cyan());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        // every line doubles as a chat message so pending prompts (feed
        // confirmations, steal menus, quiz answers) can pick it up
        console.publish(Incoming {
            author: user.clone(),
            guild: guild.clone(),
            content: line.clone(),
        });

        dispatch(
            &line,
            &guild,
            &user,
            transport.clone(),
            bank.clone(),
            parrot.clone(),
            steal.clone(),
            quiz.clone(),
        );
    }

    println!("Goodbye.");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    line: &str,
    guild: &str,
    user: &str,
    transport: Arc<dyn ChatTransport>,
    bank: Arc<dyn Bank>,
    parrot: Arc<Mutex<ParrotGame>>,
    steal: Arc<Mutex<StealGame>>,
    quiz: Arc<Mutex<QuizGame>>,
) -> tokio::task::JoinHandle<()> {
    let words: Vec<String> = line.split_whitespace().map(String::from).collect();
    let guild = guild.to_string();
    let user = user.to_string();

    tokio::spawn(async move {
        let result: Result<()> = match *words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["help"] => {
                print_help();
                Ok(())
            }
            ["bank", "register"] => bank.open_account(&user).map(|_| {
                println!("Account opened. Balance: {}", bank.balance(&user));
            }),
            ["bank", "balance"] => {
                println!("Balance: {}", bank.balance(&user));
                Ok(())
            }
            ["bank", "deposit", amount] => match amount.parse::<i64>() {
                Ok(amount) => bank.deposit(&user, amount).map(|_| {
                    println!("Balance: {}", bank.balance(&user));
                }),
                Err(_) => {
                    eprintln!("{}", "Amount must be a number.".red());
                    Ok(())
                }
            },
            ["feed", amount] => match amount.parse::<i64>() {
                Ok(amount) => {
                    ParrotGame::feed(&parrot, transport.as_ref(), bank.as_ref(), &guild, &user, amount).await
                }
                Err(_) => {
                    eprintln!("{}", "Amount must be a number.".red());
                    Ok(())
                }
            },
            ["parrot", "info"] => {
                parrot.lock().await.info(transport.as_ref(), &guild, Utc::now()).await
            }
            ["parrot", "feeders"] => {
                parrot.lock().await.feeders(transport.as_ref(), &guild).await
            }
            ["parrot", "steal", target] => {
                let target = target.to_string();
                ParrotGame::perch_steal(&parrot, transport.as_ref(), bank.as_ref(), &guild, &user, &target).await
            }
            ["parrot", "setcost", cost] => match cost.parse::<i64>() {
                Ok(cost) => parrot.lock().await.set_cost(transport.as_ref(), &guild, cost).await,
                Err(_) => {
                    eprintln!("{}", "Cost must be a number.".red());
                    Ok(())
                }
            },
            ["parrot", "starvetime"] => {
                ParrotGame::set_starve_time(&parrot, transport.as_ref(), &guild, &user, None, 0).await
            }
            ["parrot", "starvetime", hour] => match hour.parse::<u32>() {
                Ok(hour) => {
                    ParrotGame::set_starve_time(&parrot, transport.as_ref(), &guild, &user, Some(hour), 0).await
                }
                Err(_) => {
                    eprintln!("{}", "Hour must be a number.".red());
                    Ok(())
                }
            },
            ["parrot", "starvetime", hour, minute] => {
                match (hour.parse::<u32>(), minute.parse::<u32>()) {
                    (Ok(hour), Ok(minute)) => {
                        ParrotGame::set_starve_time(&parrot, transport.as_ref(), &guild, &user, Some(hour), minute).await
                    }
                    _ => {
                        eprintln!("{}", "Hour and minute must be numbers.".red());
                        Ok(())
                    }
                }
            }
            ["parrot", "perchinterval"] => {
                ParrotGame::set_perch_interval(&parrot, transport.as_ref(), &guild, &user, None).await
            }
            ["parrot", "perchinterval", minutes] => match minutes.parse::<u32>() {
                Ok(minutes) => {
                    ParrotGame::set_perch_interval(&parrot, transport.as_ref(), &guild, &user, Some(minutes)).await
                }
                Err(_) => {
                    eprintln!("{}", "Minutes must be a number.".red());
                    Ok(())
                }
            },
            ["parrot", "checknow"] => {
                parrot.lock().await.check_now(transport.as_ref(), &user).await
            }
            ["steal"] => {
                StealGame::menu(&steal, &parrot, transport.as_ref(), bank.as_ref(), &guild, &user).await
            }
            ["quiz", "play"] => QuizGame::play(&quiz, transport.as_ref(), &guild, &user).await,
            _ => Ok(()),
        };

        if let Err(e) = result {
            eprintln!("{}", format!("command failed: {:#}", e).red());
        }
    })
}

fn print_help() {
    println!("{}", "Commands".cyan().bold());
    println!("  bank register | balance | deposit <amount>");
    println!("  feed <pellets>");
    println!("  parrot info | feeders | steal <user> | setcost <credits>");
    println!("  parrot starvetime [hour [minute]] | perchinterval [minutes] | checknow");
    println!("  steal");
    println!("  quiz play");
    println!("  quit");
    println!("Anything else is sent as a chat message (prompt replies, quiz answers).");
}

/// Print a summary of the saved game state.
pub async fn handle_status(data_dir: Option<PathBuf>) -> Result<()> {
    let config = Config::new(data_dir)?;

    let parrot = ParrotGame::new(&config)?;
    println!("{}", "Parrot".green().bold());
    let [hour, minute] = parrot.save.global.starve_time;
    println!(
        "  starve check {:02}:{:02} UTC, perch every {} min",
        hour, minute, parrot.save.global.perch_interval
    );
    if parrot.save.guilds.is_empty() {
        println!("  {}", "no guilds yet".dimmed());
    }
    for (guild, record) in &parrot.save.guilds {
        let p = &record.parrot;
        println!(
            "  {:<16} {}/{} pellets, {} checks alive, {} feeders{}",
            guild.cyan(),
            p.fullness,
            p.appetite,
            p.checks_alive,
            record.feeders.len(),
            if p.starved_loops > 0 {
                format!(", {}", format!("starving x{}", p.starved_loops).red())
            } else {
                String::new()
            }
        );
    }

    let steal = StealGame::new(&config)?;
    println!("{}", "Steal".green().bold());
    if steal.save.guilds.is_empty() {
        println!("  {}", "no guilds yet".dimmed());
    }
    for (guild, record) in &steal.save.guilds {
        println!(
            "  {:<16} {} players, {} thefts today",
            guild.cyan(),
            record.players.len(),
            record.theft_count
        );
    }

    let accounts: std::collections::HashMap<String, i64> =
        store::load_or_default(&config.bank_file(), std::collections::HashMap::new)?;
    println!("{}", "Bank".green().bold());
    println!("  {} accounts", accounts.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::temp_config;
    use crate::ledger::testing::MemoryBank;
    use crate::transport::testing::RecordingTransport;

    struct Shell {
        transport: Arc<dyn ChatTransport>,
        bank: Arc<MemoryBank>,
        parrot: Arc<Mutex<ParrotGame>>,
        steal: Arc<Mutex<StealGame>>,
        quiz: Arc<Mutex<QuizGame>>,
    }

    impl Shell {
        fn new(label: &str) -> Self {
            let config = temp_config(label);
            Shell {
                transport: Arc::new(RecordingTransport::new()),
                bank: Arc::new(MemoryBank::new()),
                parrot: Arc::new(Mutex::new(ParrotGame::new(&config).unwrap())),
                steal: Arc::new(Mutex::new(StealGame::new(&config).unwrap())),
                quiz: Arc::new(Mutex::new(QuizGame::new())),
            }
        }

        async fn run(&self, line: &str) {
            dispatch(
                line,
                "g",
                "alice",
                self.transport.clone(),
                self.bank.clone(),
                self.parrot.clone(),
                self.steal.clone(),
                self.quiz.clone(),
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_bank_commands_dispatch() {
        let shell = Shell::new("cli-bank");
        let alice = "alice".to_string();

        shell.run("bank register").await;
        assert!(shell.bank.account_exists(&alice));

        shell.run("bank deposit 250").await;
        assert_eq!(shell.bank.balance(&alice), 250);
    }

    #[tokio::test]
    async fn test_failed_command_does_not_panic_the_task() {
        let shell = Shell::new("cli-bank-err");
        let alice = "alice".to_string();

        // deposit without an account fails inside the spawned task; the
        // task reports and finishes instead of unwinding
        shell.run("bank deposit 250").await;
        assert!(!shell.bank.account_exists(&alice));
        assert_eq!(shell.bank.balance(&alice), 0);
    }
}
