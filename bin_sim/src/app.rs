// Read-only terminal dashboard. Four panels mirror the run: the node
// table, each node's queued message kinds, the simulation parameters and
// the recently confirmed transactions. Everything is sampled fresh each
// tick from the shared handles; nothing here mutates simulation state.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use tui::backend::{Backend, CrosstermBackend};
use tui::layout::{Constraint, Direction, Layout, Rect};
use tui::text::Spans;
use tui::widgets::{Block, Borders, Paragraph};
use tui::{Frame, Terminal};

use lib_bookkeeper::bookkeeper::{BookkeeperStatus, DbftConfig};
use lib_miner::miner::{MinerStatus, PowConfig};
use lib_network::bus::{DbftMessage, MessageBus, PowMessage};
use lib_tx_pool::pool::TxPool;

const TICK: Duration = Duration::from_millis(200);

/// The dashboard for whichever protocol is running.
pub enum Dashboard {
    Pow {
        config: PowConfig,
        nodes: Vec<Arc<Mutex<MinerStatus>>>,
        bus: Arc<MessageBus<PowMessage>>,
        pool: Arc<TxPool>,
    },
    Dbft {
        config: DbftConfig,
        nodes: Vec<Arc<Mutex<BookkeeperStatus>>>,
        bus: Arc<MessageBus<DbftMessage>>,
        pool: Arc<TxPool>,
    },
}

impl Dashboard {
    pub fn pow(
        config: PowConfig,
        nodes: Vec<Arc<Mutex<MinerStatus>>>,
        bus: Arc<MessageBus<PowMessage>>,
        pool: Arc<TxPool>,
    ) -> Dashboard {
        Dashboard::Pow {
            config,
            nodes,
            bus,
            pool,
        }
    }

    pub fn dbft(
        config: DbftConfig,
        nodes: Vec<Arc<Mutex<BookkeeperStatus>>>,
        bus: Arc<MessageBus<DbftMessage>>,
        pool: Arc<TxPool>,
    ) -> Dashboard {
        Dashboard::Dbft {
            config,
            nodes,
            bus,
            pool,
        }
    }

    /// Render until `q` or Esc, then restore the terminal and end the
    /// whole process; the workers have no orderly shutdown of their own.
    pub fn run(self) {
        if let Err(err) = self.ui_loop() {
            eprintln!("dashboard error: {}", err);
        }
        std::process::exit(0);
    }

    fn ui_loop(&self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        loop {
            // draw failures are transient; try again next tick
            let _ = terminal.draw(|frame| self.draw(frame));

            if event::poll(TICK)? {
                if let Event::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        _ => {}
                    }
                }
            }
        }

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;
        Ok(())
    }

    fn draw<B: Backend>(&self, frame: &mut Frame<B>) {
        let node_count = self.node_count() as u16;
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(70), Constraint::Length(44)])
            .split(frame.size());
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(node_count + 3),
                Constraint::Length(node_count + 2),
                Constraint::Min(8),
            ])
            .split(columns[0]);

        self.draw_nodes(frame, rows[0]);
        self.draw_queues(frame, rows[1]);
        self.draw_parameters(frame, rows[2]);
        self.draw_confirmations(frame, columns[1]);
    }

    fn node_count(&self) -> usize {
        match self {
            Dashboard::Pow { nodes, .. } => nodes.len(),
            Dashboard::Dbft { nodes, .. } => nodes.len(),
        }
    }

    fn draw_nodes<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let mut lines: Vec<Spans> = Vec::new();
        match self {
            Dashboard::Pow { nodes, .. } => {
                lines.push(Spans::from(format!(
                    "{:<4}{:<8}{:<6}{:<24}{}",
                    "ID", "HEIGHT", "DIFF", "ACTIVITY", "TIP HASH"
                )));
                for handle in nodes {
                    if let Ok(status) = handle.lock() {
                        lines.push(Spans::from(format!(
                            "{:<4}{:<8}{:<6}{:<24}{}",
                            status.id,
                            status.height,
                            status.difficulty,
                            status.activity,
                            status.tip_hash
                        )));
                    }
                }
            }
            Dashboard::Dbft { nodes, .. } => {
                lines.push(Spans::from(format!(
                    "{:<4}{:<8}{:<6}{:<10}{:<11}{:<22}{}",
                    "ID", "HEIGHT", "VIEW", "ROLE", "FAULT", "ACTIVITY", "TIP HASH"
                )));
                for handle in nodes {
                    if let Ok(status) = handle.lock() {
                        let role = if status.speaker { "SPEAKER" } else { "DELEGATE" };
                        let fault = if !status.responsive {
                            "DOWN"
                        } else if !status.honest {
                            "BYZANTINE"
                        } else {
                            "-"
                        };
                        lines.push(Spans::from(format!(
                            "{:<4}{:<8}{:<6}{:<10}{:<11}{:<22}{}",
                            status.id,
                            status.height,
                            status.view,
                            role,
                            fault,
                            status.activity,
                            status.tip_hash
                        )));
                    }
                }
            }
        }
        let panel = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Consensus Node Local Data"),
        );
        frame.render_widget(panel, area);
    }

    fn draw_queues<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let mut lines: Vec<Spans> = Vec::new();
        match self {
            Dashboard::Pow { nodes, bus, .. } => {
                for id in 0..nodes.len() {
                    let labels: Vec<&str> =
                        bus.snapshot(id).iter().map(|m| m.label()).collect();
                    lines.push(Spans::from(format!("{:<4}{}", id, labels.join("  "))));
                }
            }
            Dashboard::Dbft { nodes, bus, .. } => {
                for id in 0..nodes.len() {
                    let labels: Vec<&str> =
                        bus.snapshot(id).iter().map(|m| m.label()).collect();
                    lines.push(Spans::from(format!("{:<4}{}", id, labels.join("  "))));
                }
            }
        }
        let panel = Paragraph::new(lines).block(
            Block::default().borders(Borders::ALL).title("Message Queues"),
        );
        frame.render_widget(panel, area);
    }

    fn draw_parameters<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let lines: Vec<Spans> = match self {
            Dashboard::Pow { config, pool, .. } => vec![
                Spans::from(format!(
                    "Block Size: {}    Block Frequency: {}s    Difficulty Calculation (blocks): {}",
                    config.block_size, config.block_time, config.adjustment_frequency
                )),
                Spans::from(format!(
                    "Required Confirmations: {}    Partition Check (blocks): {}    Threshold: {}%",
                    config.confirmation_depth,
                    config.synchronization_frequency,
                    config.synchronization_threshold
                )),
                Spans::from(format!(
                    "Consensus Nodes: {}    Transaction Frequency: {}s    Binary Hashes: {}",
                    config.nodes, config.transaction_frequency, config.binary_hash
                )),
                Spans::from(format!(
                    "Pool: {} generated, {} pending",
                    pool.generated(),
                    pool.live()
                )),
            ],
            Dashboard::Dbft { config, pool, .. } => vec![
                Spans::from(format!(
                    "Block Size: {}    Block Time: {}s    Transaction Frequency: {}s",
                    config.block_size, config.block_time, config.transaction_frequency
                )),
                Spans::from(format!(
                    "Consensus Nodes: {}    Unresponsive: {}    Malicious: {}    Random Speaker: {}",
                    config.nodes,
                    config.unresponsive_nodes,
                    config.malicious_nodes,
                    config.random_speaker
                )),
                Spans::from(format!(
                    "Pool: {} generated, {} pending",
                    pool.generated(),
                    pool.live()
                )),
            ],
        };
        let panel = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Simulation Parameters"),
        );
        frame.render_widget(panel, area);
    }

    fn draw_confirmations<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let pool = match self {
            Dashboard::Pow { pool, .. } => pool,
            Dashboard::Dbft { pool, .. } => pool,
        };
        let mut lines: Vec<Spans> = vec![Spans::from(format!(
            "{:<8}{:<16}{}",
            "ID", "PUBLISHED", "CONFIRMED"
        ))];
        for confirmed in pool.recent_confirmations().iter().rev() {
            lines.push(Spans::from(format!(
                "{:<8}{:<16}{}",
                confirmed.id, confirmed.creation_time, confirmed.confirmation_time
            )));
        }
        let panel = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Confirmed Transactions"),
        );
        frame.render_widget(panel, area);
    }
}
