use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use api_client::HttpGraphApi;
use canvas_controller::{CanvasController, ControllerOptions, NotificationLevel};
use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use core_types::{
    CanvasNode, CanvasNodeKey, FileId, FileUpload, GraphApi, NodeData, NodeKind, NoteId, NoteUpdate,
    Position,
};
use graph_store::{GraphSnapshot, GraphStore, StoreOptions};
use i18n::I18n;
use session::{Session, SessionStore, default_session_dir_from};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mindmap", version, about = "Mind map notes, files and links from the terminal")]
pub struct Cli {
    /// Backend base url, e.g. http://localhost:8000/api/v1
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Exchange credentials for an access token and remember it
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account; log in afterwards to get a token
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Whoami,
    /// Print every node and edge on the canvas
    Graph {
        #[arg(long)]
        json: bool,
    },
    #[command(subcommand)]
    Note(NoteCommand),
    #[command(subcommand)]
    File(FileCommand),
    /// Connect two nodes, e.g. `connect note-1 file-2`
    Connect { source: String, target: String },
    /// Remove a connection, e.g. `disconnect edge-5`
    Disconnect { edge: String },
    Relabel { edge: String, label: String },
    /// Move a node, e.g. `move note-1 120 80`
    #[command(allow_negative_numbers = true)]
    Move { node: String, x: f64, y: f64 },
    Search { query: String },
    Ask { query: String },
}

#[derive(Debug, Subcommand)]
pub enum NoteCommand {
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        content: String,
        #[arg(long, requires = "y")]
        x: Option<f64>,
        #[arg(long, requires = "x")]
        y: Option<f64>,
    },
    List,
    Edit(NoteEditArgs),
    Delete { id: NoteId },
}

#[derive(Debug, Args)]
pub struct NoteEditArgs {
    pub id: NoteId,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub content: Option<String>,
    /// Comma separated
    #[arg(long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Subcommand)]
pub enum FileCommand {
    Upload {
        path: PathBuf,
        #[arg(long)]
        mime_type: Option<String>,
    },
    List,
    Delete {
        id: FileId,
    },
    Download {
        id: FileId,
        #[arg(long, short)]
        out: PathBuf,
    },
}

struct App {
    config: AppConfig,
    session: Arc<Session>,
    api: Arc<HttpGraphApi>,
    controller: CanvasController,
}

impl App {
    fn build(config: AppConfig, data_dir: &Path) -> Result<Self> {
        let session = Arc::new(Session::restore(SessionStore::new(
            default_session_dir_from(data_dir),
        ))?);
        let api = Arc::new(
            HttpGraphApi::with_timeout(
                config.api.base_url.clone(),
                session.clone(),
                config.api.timeout_secs.map(Duration::from_secs),
            )
            .context("failed to build http client")?,
        );
        let store = Arc::new(GraphStore::with_options(
            api.clone(),
            StoreOptions {
                position_bound: config.canvas.default_position_bound,
                revert_position_on_failure: config.canvas.revert_position_on_failure,
            },
        ));
        let controller = CanvasController::with_options(
            store,
            I18n::new(config.language),
            ControllerOptions {
                drag_threshold_px: config.canvas.drag_threshold_px,
                search_top_k: config.search.top_k,
            },
        );
        Ok(Self {
            config,
            session,
            api,
            controller,
        })
    }

    async fn mount(&self) -> Result<GraphSnapshot> {
        let mounted = self.controller.mount(self.session.as_ref()).await;
        self.flush_notifications();
        mounted?;
        Ok(self.controller.store().snapshot())
    }

    fn flush_notifications(&self) {
        for toast in self.controller.take_notifications() {
            match toast.level {
                NotificationLevel::Error => eprintln!("! {}", toast.message),
                NotificationLevel::Info | NotificationLevel::Success => {
                    println!("* {}", toast.message)
                }
            }
        }
    }

    /// Runs a controller action and prints whatever it reported.
    async fn report<T, F>(&self, action: F) -> Result<T>
    where
        F: std::future::Future<Output = canvas_controller::ControllerResult<T>>,
    {
        let outcome = action.await;
        self.flush_notifications();
        Ok(outcome?)
    }
}

pub async fn run(cli: Cli, config: AppConfig, data_dir: &Path) -> Result<()> {
    let app = App::build(config, data_dir)?;
    info!(base_url = %app.api.base_url(), "starting command");

    match cli.command {
        Command::Login { email, password } => {
            let token = app.api.login(&email, &password).await?;
            app.session.set_token(token.access_token)?;
            match app.api.current_user().await? {
                Some(user) => println!("logged in as {}", user.email),
                None => bail!("token was rejected right after login"),
            }
        }
        Command::Signup { email, password } => {
            let user = app.api.signup(&email, &password).await?;
            info!(user_id = user.id, "account created");
            println!("created account {} (id {}); run `mindmap login` next", user.email, user.id);
        }
        Command::Logout => {
            app.session.logout()?;
            println!("logged out");
        }
        Command::Whoami => match app.api.current_user().await? {
            Some(user) => println!("{} (id {})", user.email, user.id),
            None => println!("not logged in"),
        },
        Command::Graph { json } => {
            let snapshot = app.mount().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_graph(&snapshot);
            }
        }
        Command::Note(command) => run_note(&app, command).await?,
        Command::File(command) => run_file(&app, command).await?,
        Command::Connect { source, target } => {
            app.mount().await?;
            let edge = app
                .report(app.controller.on_connect(&source, &target))
                .await?;
            println!("{}", edge.key);
        }
        Command::Disconnect { edge } => {
            app.mount().await?;
            app.report(app.controller.on_edge_remove(&edge)).await?;
        }
        Command::Relabel { edge, label } => {
            app.mount().await?;
            app.controller.on_edge_click(&edge)?;
            app.controller.begin_edge_label_edit()?;
            app.report(app.controller.commit_edge_label(&label)).await?;
        }
        Command::Move { node, x, y } => {
            app.mount().await?;
            let key: CanvasNodeKey = node.parse()?;
            let target = Position::new(x, y);
            app.controller.on_node_drag(&key, target)?;
            let saved = app
                .report(app.controller.on_node_drag_stop(&key, target))
                .await?;
            if !saved {
                println!("{key} did not move far enough to be saved");
            }
        }
        Command::Search { query } => {
            app.mount().await?;
            let hits = app.report(app.controller.search(&query)).await?;
            for found in &hits.response.results {
                println!(
                    "{:>6.3}  {}  {}",
                    found.score.unwrap_or_default(),
                    found.note_id().map(|id| id.to_string()).unwrap_or_default(),
                    found.title().unwrap_or("")
                );
            }
            print_highlighted(&app.controller.highlighted());
        }
        Command::Ask { query } => {
            app.mount().await?;
            let answer = app.report(app.controller.ask(&query)).await?;
            println!("{}", answer.answer.answer);
            for source in &answer.answer.sources {
                println!(
                    "  - {} {}",
                    source.note_id.map(|id| format!("#{id}")).unwrap_or_default(),
                    source.title.as_deref().unwrap_or("")
                );
            }
            print_highlighted(&answer.highlighted);
        }
    }
    Ok(())
}

async fn run_note(app: &App, command: NoteCommand) -> Result<()> {
    match command {
        NoteCommand::Create {
            title,
            content,
            x,
            y,
        } => {
            app.mount().await?;
            let position = x.zip(y).map(|(x, y)| Position::new(x, y));
            let node = app
                .report(app.controller.create_note(&title, &content, position))
                .await?;
            print_created(node.as_ref());
        }
        NoteCommand::List => {
            let page = app.api.list_notes(0, app.config.canvas.page_limit).await?;
            for note in &page.items {
                println!("{:>5}  {}", note.id, note.title.as_deref().unwrap_or(""));
            }
            println!("{} of {} notes", page.items.len(), page.total);
        }
        NoteCommand::Edit(args) => {
            let snapshot = app.mount().await?;
            let key = snapshot
                .nodes
                .iter()
                .find(|node| node.owns(NodeKind::Note, args.id))
                .map(|node| node.key)
                .with_context(|| format!("note {} is not on the canvas", args.id))?;
            app.controller.on_node_double_click(&key)?;
            let update = NoteUpdate {
                title: args.title,
                content: args.content,
                tags: args.tags,
                ..NoteUpdate::default()
            };
            if update.is_empty() {
                app.controller.on_pane_click();
                bail!("nothing to change; pass --title, --content or --tags");
            }
            app.report(app.controller.save_note_edit(update)).await?;
        }
        NoteCommand::Delete { id } => {
            app.mount().await?;
            app.report(app.controller.delete_note(id)).await?;
        }
    }
    Ok(())
}

async fn run_file(app: &App, command: FileCommand) -> Result<()> {
    match command {
        FileCommand::Upload { path, mime_type } => {
            let bytes =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .with_context(|| format!("{} has no file name", path.display()))?;
            app.mount().await?;
            let node = app
                .report(app.controller.upload_file(FileUpload {
                    filename,
                    mime_type,
                    bytes,
                }))
                .await?;
            print_created(node.as_ref());
        }
        FileCommand::List => {
            let page = app.api.list_files(0, app.config.canvas.page_limit).await?;
            for file in &page.items {
                println!(
                    "{:>5}  {}  {}",
                    file.id,
                    file.filename,
                    file.mime_type.as_deref().unwrap_or("-")
                );
            }
            println!("{} of {} files", page.items.len(), page.total);
        }
        FileCommand::Delete { id } => {
            app.mount().await?;
            app.report(app.controller.delete_file(id)).await?;
        }
        FileCommand::Download { id, out } => {
            let bytes = app.controller.store().download_file(id).await?;
            fs::write(&out, &bytes)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("wrote {} bytes to {}", bytes.len(), out.display());
        }
    }
    Ok(())
}

fn print_created(node: Option<&CanvasNode>) {
    match node {
        Some(node) => println!("{}", node.key),
        None => println!("saved; the node appears once the backend links it to the graph"),
    }
}

fn print_graph(snapshot: &GraphSnapshot) {
    for node in &snapshot.nodes {
        let detail = match &node.data {
            NodeData::Note(note) => note.content.clone().unwrap_or_default(),
            NodeData::File(file) => file.mime_type.clone().unwrap_or_default(),
        };
        println!(
            "{:<12} ({:>7.1}, {:>7.1})  {}  {}",
            node.key.to_string(),
            node.position.x,
            node.position.y,
            node.data.label(),
            detail.lines().next().unwrap_or("")
        );
    }
    for edge in &snapshot.edges {
        println!(
            "{:<12} {} -> {}  {}",
            edge.key.to_string(),
            edge.source,
            edge.target,
            edge.label.as_deref().unwrap_or("")
        );
    }
    for dropped in &snapshot.dropped_edges {
        eprintln!(
            "edge-{} skipped: endpoint {} -> {} not loaded",
            dropped.edge_id, dropped.source_node_id, dropped.target_node_id
        );
    }
}

fn print_highlighted(keys: &[CanvasNodeKey]) {
    if keys.is_empty() {
        return;
    }
    let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
    println!("highlighted: {}", keys.join(", "));
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_note_edit_tags() {
        let cli = Cli::parse_from([
            "mindmap", "note", "edit", "4", "--content", "hello", "--tags", "a,b",
        ]);
        let Command::Note(NoteCommand::Edit(args)) = cli.command else {
            panic!("expected note edit");
        };
        assert_eq!(args.id, 4);
        assert_eq!(args.content.as_deref(), Some("hello"));
        assert_eq!(args.tags, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn parses_signup_credentials() {
        let cli = Cli::parse_from([
            "mindmap", "signup", "--email", "ada@example.test", "--password", "pw",
        ]);
        let Command::Signup { email, password } = cli.command else {
            panic!("expected signup");
        };
        assert_eq!(email, "ada@example.test");
        assert_eq!(password, "pw");
    }
}
