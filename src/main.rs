use std::sync::{Arc, RwLock};

use clap::Parser;

mod app;
mod auth;
mod bookmarks;
mod cli;
mod collections;
mod config;
mod eid;
mod enrichment;
mod extractor;
mod folders;
mod import;
mod llm;
mod logging;
mod public;
mod scrape;
mod search;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use config::Config;
use extractor::{ContentExtractor, WebExtractor};
use llm::{AnalysisRequest, LanguageModel, OpenAiModel};

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    logging::init();

    let base_path = match args.base_path {
        Some(path) => path,
        None => config::base_path()?,
    };
    let config = Arc::new(RwLock::new(Config::load_with(&base_path)?));

    match args.command {
        cli::Command::Daemon {} => {
            let mut app_mgr = app::AppLocal::load(config)?;
            app_mgr.run_queue()?;
            web::start_daemon(app_mgr)
        }

        cli::Command::Analyze {
            url,
            description,
            nano,
        } => {
            let (url, _) = bookmarks::normalize_url(&url)?;

            let (title, content) = match description {
                Some(description) => (None, description),
                None => {
                    let page = WebExtractor::new(config.clone()).extract(&url)?;
                    (page.title, page.text)
                }
            };

            let analysis = OpenAiModel::new(config).analyze(&AnalysisRequest {
                url,
                title,
                content,
                use_nano_model: nano,
                ..Default::default()
            })?;

            println!("{}", serde_json::to_string_pretty(&analysis)?);
            Ok(())
        }

        cli::Command::ParseExport { file } => {
            let content = std::fs::read_to_string(&file)?;
            let request = import::ImportRequest {
                bookmarks: import::parse_export(&content)?,
                use_nano_model: false,
            };

            println!("{}", serde_json::to_string_pretty(&request)?);
            Ok(())
        }
    }
}
