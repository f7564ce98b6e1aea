//! Headless mode for the story map.
//!
//! A line-oriented driver over a running session, intended for manual
//! exploration and scripted testing.

use crate::provider::SimulatedLocation;
use mindmap_core::{
    CoreConfig, FetchStatus, LocationFix, Position, SessionError, StorySession, TrackerState,
};
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, BufReader};

/// Options gathered from the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadlessOptions {
    /// Starting position, if one was given.
    pub position: Option<(f64, f64)>,
    /// Refuse location permission.
    pub deny: bool,
}

/// Run the driver until `#quit` or end of input.
///
/// Lines starting with `#` are commands; everything else is ignored.
pub async fn run_headless(config: CoreConfig, options: HeadlessOptions) -> Result<(), SessionError> {
    let position = options
        .position
        .map(|(latitude, longitude)| Position::new(latitude, longitude));
    let location = Arc::new(SimulatedLocation::new(position, !options.deny));
    let session = StorySession::connect(config, location.clone())?;

    println!("=== Mindmap Headless Mode ===");
    if let Some(base) = &session.config().api_base {
        println!("API: {base}");
    }
    println!("Data: {}", session.config().data_dir.display());
    println!();
    print_commands();
    println!();

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        let Some(command) = line.strip_prefix('#') else {
            if !line.is_empty() {
                println!("[ERROR] Commands start with '#'. Type #help for help.");
            }
            continue;
        };

        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first().copied() {
            Some("quit") | Some("exit") => {
                println!("Goodbye!");
                break;
            }
            Some("status") => print_status(&session),
            Some("stories") => print_stories(&session),
            Some("triggers") => print_triggers(&session),
            Some("refresh") => {
                session.controls().refresh();
                println!("[OK] Refresh requested");
            }
            Some("locate") => {
                location.set_granted(true);
                session.controls().request_location();
                println!("[OK] Location requested");
            }
            Some("goto") => match parse_coordinates(&parts[1..]) {
                Some((latitude, longitude)) => {
                    location.move_to(latitude, longitude);
                    println!("[OK] Moved to {latitude}, {longitude}");
                }
                None => println!("[ERROR] Usage: #goto <lat> <lon>"),
            },
            Some("unlock") => match parts.get(1) {
                Some(id) => unlock(&session, id).await,
                None => println!("[ERROR] Usage: #unlock <id>"),
            },
            Some("lock") => match parts.get(1) {
                Some(id) => {
                    session.controls().lock(id).await;
                    println!("[OK] Locked {id}");
                }
                None => println!("[ERROR] Usage: #lock <id>"),
            },
            Some("clear") => {
                session.controls().clear_unlocks().await;
                println!("[OK] Cleared all unlocks");
            }
            Some("toggle") => match parts.get(1) {
                Some(tag) => {
                    let blocked = session.trigger_context().toggle(tag).await;
                    let verb = if blocked { "Hiding" } else { "Showing" };
                    println!("[OK] {verb} stories tagged {tag}");
                }
                None => println!("[ERROR] Usage: #toggle <tag>"),
            },
            Some("autorefresh") => match parts.get(1).copied() {
                Some(value @ ("on" | "off")) => {
                    let enabled = value == "on";
                    session
                        .controls()
                        .update_settings(|s| s.auto_refresh = enabled)
                        .await;
                    println!("[OK] Auto-refresh {value}");
                }
                _ => println!("[ERROR] Usage: #autorefresh on|off"),
            },
            Some("help") => {
                println!("[HELP]");
                print_commands();
            }
            _ => println!("[ERROR] Unknown command. Type #help for help."),
        }
    }

    session.shutdown();
    Ok(())
}

fn print_commands() {
    println!("Commands:");
    println!("  #status             - Show fetch, location and settings state");
    println!("  #stories            - List visible stories");
    println!("  #triggers           - List trigger warnings and the blacklist");
    println!("  #refresh            - Fetch the catalog again");
    println!("  #locate             - Request location permission again");
    println!("  #goto <lat> <lon>   - Move the simulated position");
    println!("  #unlock <id>        - Unlock a story within range");
    println!("  #lock <id>          - Lock a story again");
    println!("  #clear              - Lock every story");
    println!("  #toggle <tag>       - Hide or show stories with a trigger warning");
    println!("  #autorefresh on|off - Enable or disable periodic refresh");
    println!("  #help               - Show this help");
    println!("  #quit               - Exit");
}

fn print_status(session: &StorySession) {
    let stories = session.story_context();
    let location = session.location_context();
    let controls = session.controls();

    println!("[STATUS]");
    println!("  Ready: {}", session.is_ready());
    println!("  Fetch: {}", describe_fetch(stories.fetch_status));
    println!("  Stories: {} visible", stories.stories.len());
    println!("  Unlocked: {}", stories.unlocked.len());
    println!("  Location: {}", describe_fix(&location.location));
    println!("  Permission: {}", describe_state(location.state));
    if location.awaiting_location {
        println!("  (waiting for location)");
    }
    println!(
        "  Auto-refresh: {}",
        if controls.settings.auto_refresh { "on" } else { "off" }
    );
}

fn print_stories(session: &StorySession) {
    let stories = session.story_context();
    let location = session.location_context();

    if stories.stories.is_empty() {
        println!("[STORIES] none");
        return;
    }

    println!("[STORIES]");
    for story in &stories.stories {
        let status = location.unlock_status(story, stories.is_unlocked(&story.id));
        let distance = location.distance(story);
        if distance.is_finite() {
            println!("  [{}] {} ({distance} m) - {status}", story.id, story.title);
        } else {
            println!("  [{}] {} - {status}", story.id, story.title);
        }
        if let Some(url) = stories.image_url(story) {
            println!("      image: {url}");
        }
    }
}

fn print_triggers(session: &StorySession) {
    let triggers = session.trigger_context();

    if triggers.known_triggers.is_empty() {
        println!("[TRIGGERS] none");
        return;
    }

    println!("[TRIGGERS]");
    for (tag, info) in &triggers.known_triggers {
        let mark = if triggers.is_blocked(tag) { "x" } else { " " };
        println!(
            "  [{mark}] {tag} ({} {}) - {}",
            info.story_count,
            if info.story_count == 1 { "story" } else { "stories" },
            info.description
        );
    }
}

async fn unlock(session: &StorySession, id: &str) {
    let stories = session.story_context();
    let Some(story) = stories.story(id) else {
        println!("[ERROR] No visible story with id {id}");
        return;
    };

    if !session.location_context().can_unlock(story) {
        let status = session.location_context().unlock_status(story, false);
        println!("[ERROR] {status}");
        return;
    }

    session.controls().unlock(id).await;
    println!("[OK] Unlocked {}", story.title);
}

fn describe_fetch(status: FetchStatus) -> &'static str {
    match status {
        FetchStatus::InProgress => "in progress",
        FetchStatus::Done => "done",
        FetchStatus::Failed => "failed (showing cached stories)",
    }
}

fn describe_fix(fix: &LocationFix) -> String {
    match fix {
        LocationFix::Unrequested => "not requested".to_string(),
        LocationFix::Denied => "denied".to_string(),
        LocationFix::Known(position) => format!(
            "{:.5}, {:.5}",
            position.coords.latitude, position.coords.longitude
        ),
    }
}

fn describe_state(state: TrackerState) -> &'static str {
    match state {
        TrackerState::Unrequested => "not requested",
        TrackerState::Requesting => "requesting",
        TrackerState::Granted => "granted",
        TrackerState::Denied => "denied",
    }
}

fn parse_coordinates(parts: &[&str]) -> Option<(f64, f64)> {
    match parts {
        [lat, lon] => Some((lat.parse().ok()?, lon.parse().ok()?)),
        _ => None,
    }
}

/// Parse headless options from command line arguments.
pub fn parse_options_from_args(args: &[String]) -> HeadlessOptions {
    let mut options = HeadlessOptions::default();
    let mut latitude = None;
    let mut longitude = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--lat" => {
                latitude = args.get(i + 1).and_then(|v| v.parse::<f64>().ok());
                i += 1;
            }
            "--lon" => {
                longitude = args.get(i + 1).and_then(|v| v.parse::<f64>().ok());
                i += 1;
            }
            "--deny" => options.deny = true,
            _ => {}
        }
        i += 1;
    }

    options.position = latitude.zip(longitude);
    options
}
