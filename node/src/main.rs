use std::{env, io, path::Path};

use coordinator::{Hparams, InferenceOpts, launch};
use log::info;
use tokio::signal;

const USAGE: &str = "usage: node <train|infer> <config.json>";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let (Some(command), Some(config)) = (args.next(), args.next()) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, USAGE));
    };
    let config = Path::new(&config);

    match command.as_str() {
        "train" => {
            let hparams = Hparams::from_json_file(config)?;

            tokio::select! {
                ret = launch::train(hparams) => {
                    for summary in ret? {
                        info!(
                            rank = summary.rank;
                            "{} batches, {} optimizer steps, {} checkpoints",
                            summary.batches,
                            summary.optim_step,
                            summary.saved.len()
                        );
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("received SIGTERM");
                }
            }
        }
        "infer" => {
            let opts = InferenceOpts::from_json_file(config)?;

            tokio::select! {
                ret = launch::infer(opts) => {
                    let summary = ret?;
                    info!("wrote {} waveforms", summary.outputs.len());
                }
                _ = signal::ctrl_c() => {
                    info!("received SIGTERM");
                }
            }
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown command '{other}', {USAGE}"),
            ));
        }
    }

    Ok(())
}
