use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::SerenityInit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod cache;
mod config;
mod error;
mod sources;
mod storage;
mod ui;

use crate::audio::player::{AudioPlayer, PlayerDeps};
use crate::audio::voice::SongbirdTranscoder;
use crate::bot::{events::DiscordNotifier, JukeboxBot};
use crate::cache::CacheManager;
use crate::config::Config;
use crate::sources::YouTubeClient;
use crate::storage::JsonStorage;

const SHUTDOWN_DOWNLOAD_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jukebox_bot=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Jukebox v{}", env!("CARGO_PKG_VERSION"));

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    let config = Config::load()?;
    info!("{}", config.summary());

    // Inicializar almacenamiento JSON
    let storage = Arc::new(tokio::sync::Mutex::new(
        JsonStorage::new(config.data_dir.clone()).await?,
    ));

    let youtube = Arc::new(YouTubeClient::new());
    match youtube.verify_dependencies().await {
        Ok(version) => info!("✅ yt-dlp {}", version),
        Err(e) => warn!("⚠️ yt-dlp no disponible: {:?}", e),
    }

    let cache = CacheManager::new(config.cache_settings(), youtube.clone(), storage.clone())?;
    if let Err(e) = cache.enforce_limit().await {
        warn!("⚠️ No se pudo aplicar el límite de caché al iniciar: {}", e);
    }

    let http = Arc::new(Http::new(&config.discord_token));
    let deps = PlayerDeps {
        resolver: youtube.clone(),
        feed: youtube,
        transcoder: Arc::new(SongbirdTranscoder::new(reqwest::Client::new())),
        cache,
        notifier: Arc::new(DiscordNotifier::new(http, storage.clone())),
    };
    let (player, events) = AudioPlayer::new(deps, config.player_config());
    player.spawn_event_loop(events);

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = JukeboxBot::new(config.clone(), storage, player.clone());

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird()
        .await?;

    // Al cerrar, cada guild se detiene como con /stop
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        let registry = player.registry();
        if !registry.is_empty() {
            info!("⏹️ Deteniendo {} guilds", registry.len());
        }
        let mut downloads = Vec::new();
        for guild_id in registry.guild_ids() {
            downloads.extend(player.stop(guild_id).await.into_final_downloads());
        }

        // Se espera a la descarga final de cada sesión, con límite
        if !downloads.is_empty() {
            info!("📥 Esperando {} descargas pendientes...", downloads.len());
            let drain = async {
                for handle in downloads {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(SHUTDOWN_DOWNLOAD_GRACE, drain).await.is_err() {
                warn!("⚠️ Descargas sin terminar tras {}s, saliendo igual", SHUTDOWN_DOWNLOAD_GRACE.as_secs());
            }
        }
        std::process::exit(0);
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

async fn health_check() -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
