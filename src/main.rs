use clap::{Parser, Subcommand};
use vanopticon_prober::{config, emitter, observability, queue, run};

#[derive(Parser)]
#[command(name = "vanopticon-prober", about = "Prober - distributed network reconnaissance crawler")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the crawl engine (default)
	Run,
	/// Append a single hostname to the configured Redis work queue
	Seed {
		/// Hostname to enqueue
		host: String,
	},
	/// Flush the emitter's spool directory to the configured sink
	SpoolReplay,
	/// List batch files currently pending in the spool directory
	SpoolList,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	match cli.command.unwrap_or(Commands::Run) {
		Commands::Run => {
			match config::load() {
				Ok(settings) => println!(
					"Loaded settings: probe_id={} run_id={} concurrency={}",
					settings.probe_id, settings.run_id, settings.concurrency
				),
				Err(e) => eprintln!("Warning: failed to load config: {}", e),
			}

			run().await;
		}
		Commands::Seed { host } => match config::load() {
			Ok(settings) => match &settings.redis_queue_addr {
				Some(addr) => match queue::RedisWorkQueue::connect(addr, settings.redis_queue_key.clone()).await {
					Ok(q) => match q.seed(&host).await {
						Ok(()) => println!("seeded {}", host),
						Err(e) => eprintln!("failed to seed {}: {}", host, e),
					},
					Err(e) => eprintln!("failed to connect to work queue: {}", e),
				},
				None => eprintln!("no redis_queue_addr configured; nothing to seed into"),
			},
			Err(e) => eprintln!("failed to load config: {}", e),
		},
		Commands::SpoolReplay => match config::load() {
			Ok(settings) => {
				let metrics: std::sync::Arc<observability::MetricsRegistry> =
					observability::MetricsRegistry::new().into();
				match emitter::Emitter::new(
					settings.probe_id,
					settings.run_id,
					emitter::EmitterConfig {
						ingest_url: settings.ingest_url,
						batch_max_edges: settings.batch_max_edges,
						batch_flush_interval: std::time::Duration::from_secs(settings.batch_flush_sec),
						spool_dir: settings.spool_dir.into(),
					},
					metrics,
				) {
					Ok(emitter) => {
						emitter.drain().await;
						println!("spool replay complete");
					}
					Err(e) => eprintln!("failed to initialize emitter: {}", e),
				}
			}
			Err(e) => eprintln!("failed to load config: {}", e),
		},
		Commands::SpoolList => match config::load() {
			Ok(settings) => match std::fs::read_dir(&settings.spool_dir) {
				Ok(entries) => {
					let mut found = false;
					for entry in entries.filter_map(|e| e.ok()) {
						if entry.path().extension().map(|ext| ext == "json").unwrap_or(false) {
							found = true;
							println!("{}", entry.path().display());
						}
					}
					if !found {
						println!("spool directory is empty: {}", settings.spool_dir);
					}
				}
				Err(e) => eprintln!("failed to read spool directory {}: {}", settings.spool_dir, e),
			},
			Err(e) => eprintln!("failed to load config: {}", e),
		},
	}
}
