//! Seed records: the bundled listings, or a JSON file given on the command line.

use std::path::Path;

use anyhow::Context;
use homestead_common::models::NewProperty;

const BUNDLED: &str = include_str!("../data/properties.json");

pub fn load(path: Option<&Path>) -> anyhow::Result<Vec<NewProperty>> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading seed file {}", path.display()))?;
            parse(&text).with_context(|| format!("parsing seed file {}", path.display()))
        }
        None => parse(BUNDLED).context("parsing the bundled seed data"),
    }
}

fn parse(text: &str) -> anyhow::Result<Vec<NewProperty>> {
    Ok(serde_json::from_str(text)?)
}
