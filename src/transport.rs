use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use colored::*;
use tokio::sync::broadcast;

pub type GuildId = String;
pub type UserId = String;

/// A chat message as seen by the games. Every inbound line is fanned out to
/// all interested flows (confirmation prompts, menus, quiz answers).
#[derive(Debug, Clone)]
pub struct Incoming {
    pub author: UserId,
    pub guild: GuildId,
    pub content: String,
}

/// The chat platform the games run on. The real platform is out of scope;
/// this is its contract: send text into a guild or a DM, wait for a reply
/// from a specific user with a bounded timeout, and leave a guild.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, guild: &GuildId, text: &str) -> Result<()>;

    async fn send_dm(&self, user: &UserId, text: &str) -> Result<()>;

    /// Visual countdown affordance. Best effort.
    async fn add_reaction(&self, guild: &GuildId, emoji: &str) -> Result<()>;

    /// Wait for the next message from `author`. `None` means the user did
    /// not respond in time, which callers treat as an implicit cancel.
    async fn await_reply(&self, author: &UserId, timeout: Duration) -> Option<String>;

    /// Subscribe to the raw message stream (used by the quiz to collect
    /// answers from everyone at once).
    fn subscribe(&self) -> broadcast::Receiver<Incoming>;

    async fn leave_guild(&self, guild: &GuildId) -> Result<()>;
}

/// Terminal-backed transport for the interactive shell. The shell publishes
/// every stdin line; sends go to stdout with a guild/DM prefix.
pub struct ConsoleTransport {
    tx: broadcast::Sender<Incoming>,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        ConsoleTransport { tx }
    }

    pub fn publish(&self, message: Incoming) {
        // send only fails when nobody is listening, which is fine
        let _ = self.tx.send(message);
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send(&self, guild: &GuildId, text: &str) -> Result<()> {
        println!("{} {}", format!("[{}]", guild).cyan(), text);
        Ok(())
    }

    async fn send_dm(&self, user: &UserId, text: &str) -> Result<()> {
        println!("{} {}", format!("[dm → {}]", user).magenta(), text);
        Ok(())
    }

    async fn add_reaction(&self, _guild: &GuildId, emoji: &str) -> Result<()> {
        println!("  {}", emoji.dimmed());
        Ok(())
    }

    async fn await_reply(&self, author: &UserId, timeout: Duration) -> Option<String> {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(msg) if msg.author == *author => return Some(msg.content),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    fn subscribe(&self) -> broadcast::Receiver<Incoming> {
        self.tx.subscribe()
    }

    async fn leave_guild(&self, guild: &GuildId) -> Result<()> {
        println!("{}", format!("[{}] *** left the guild ***", guild).red());
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted transport for tests: canned replies are handed out in order,
    /// everything sent is recorded.
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<(String, String)>>,
        pub dms: Mutex<Vec<(String, String)>>,
        pub left: Mutex<Vec<GuildId>>,
        replies: Mutex<VecDeque<String>>,
        tx: broadcast::Sender<Incoming>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            let (tx, _) = broadcast::channel(64);
            RecordingTransport {
                sent: Mutex::new(Vec::new()),
                dms: Mutex::new(Vec::new()),
                left: Mutex::new(Vec::new()),
                replies: Mutex::new(VecDeque::new()),
                tx,
            }
        }

        pub fn with_replies(replies: &[&str]) -> Self {
            let transport = Self::new();
            {
                let mut queue = transport.replies.lock().unwrap();
                for reply in replies {
                    queue.push_back(reply.to_string());
                }
            }
            transport
        }

        pub fn sent_texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }

        pub fn dm_texts(&self) -> Vec<String> {
            self.dms.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send(&self, guild: &GuildId, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push((guild.clone(), text.to_string()));
            Ok(())
        }

        async fn send_dm(&self, user: &UserId, text: &str) -> Result<()> {
            self.dms.lock().unwrap().push((user.clone(), text.to_string()));
            Ok(())
        }

        async fn add_reaction(&self, _guild: &GuildId, _emoji: &str) -> Result<()> {
            Ok(())
        }

        async fn await_reply(&self, _author: &UserId, _timeout: Duration) -> Option<String> {
            self.replies.lock().unwrap().pop_front()
        }

        fn subscribe(&self) -> broadcast::Receiver<Incoming> {
            self.tx.subscribe()
        }

        async fn leave_guild(&self, guild: &GuildId) -> Result<()> {
            self.left.lock().unwrap().push(guild.clone());
            Ok(())
        }
    }
}
