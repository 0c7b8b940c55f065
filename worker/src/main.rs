use std::{env, io, num::NonZeroUsize, str::FromStr};

use log::info;

use worker::{TrainConfig, train_local, train_tcp};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1:29500";

fn main() -> io::Result<()> {
    env_logger::init();

    let config = match env::var("CONFIG") {
        Ok(path) => TrainConfig::load(&path)?,
        Err(_) => TrainConfig::default(),
    };

    if let Some(workers) = var::<NonZeroUsize>("LOCAL_WORKERS")? {
        let reports = train_local(config, workers)?;
        info!(workers = reports.len(); "local group finished");
        return Ok(());
    }

    let world_size = var("WORLD_SIZE")?.unwrap_or(1);
    let rank = var("RANK")?.unwrap_or(0);
    let addr = env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());

    let reports = train_tcp(config, &addr, rank, world_size)?;
    info!(rank = rank, epochs = reports.len(); "wrapping up");

    Ok(())
}

/// Parses the environment variable `key`, if set.
fn var<T: FromStr>(key: &str) -> io::Result<Option<T>> {
    let Ok(value) = env::var(key) else {
        return Ok(None);
    };

    value.parse().map(Some).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid {key}: {value}"),
        )
    })
}
