use std::process::ExitCode;

use clap::Parser;
use pipeline::{Pipeline, Stage};
use webmon::args::{self, Args};
use webmon::stages::{Fetcher, Reporter, Scheduler, Sink, Validator};
use webmon::{Message, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    logger::init();

    let args = Args::parse();
    let (targets, database) = match args::configuration(&args) {
        Ok(configuration) => configuration,
        Err(error) => {
            tracing::error!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let settings = Settings::default();
    let mut stages: Vec<Box<dyn Stage<Message>>> = vec![
        Box::new(Scheduler::new(settings.clone())),
        Box::new(Fetcher::new(settings.clone())),
        Box::new(Validator::new(settings.clone())),
    ];
    match database {
        Some(details) => stages.push(Box::new(Sink::new(details, settings))),
        None => {
            tracing::warn!("no database configured, measurements will only be logged");
            stages.push(Box::new(Reporter));
        }
    }

    let pipeline = match Pipeline::build(stages) {
        Ok(pipeline) => pipeline,
        Err(error) => {
            tracing::error!("{error}");
            return ExitCode::FAILURE;
        }
    };

    pipeline.put(Message::Reload(targets));

    // ctrl-c feeds the terminal value into the head queue; the stages
    // finish their in-flight work, drain and exit in order.
    let input = pipeline.input();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            input.put(Message::Terminal);
        }
    });

    pipeline.wait().await;
    ExitCode::SUCCESS
}
