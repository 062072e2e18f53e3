// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use points_ledger::{ActionType, Ledger, References, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;

/// Points Ledger - Replay ledger event CSV files
///
/// Reads ledger events from a CSV file and outputs final balances to stdout.
/// Supports user registration, credits (earn, purchase, subscription,
/// refund), and idempotent spends.
#[derive(Parser, Debug)]
#[command(name = "points-ledger")]
#[command(about = "Replays a points ledger event CSV and prints balances", long_about = None)]
struct Args {
    /// Path to CSV file with ledger events
    ///
    /// Expected format: type,user,amount,key,description
    /// Example: cargo run -- events.csv > balances.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

fn main() {
    // Parse command line arguments
    let args = Args::parse();

    // Open input file
    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    // Replay events from CSV
    let ledger = match replay_events(BufReader::new(file)) {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("Error replaying events: {}", e);
            process::exit(1);
        }
    };

    // Write results to stdout
    if let Err(e) = write_balances(&ledger, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `type, user, amount, key, description`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    event_type: String,
    user: u64,
    #[serde(deserialize_with = "csv::invalid_option")]
    amount: Option<i64>,
    key: Option<String>,
    description: Option<String>,
}

impl CsvRecord {
    /// Applies the record to the ledger.
    ///
    /// Returns `false` for unknown event types, missing required fields, or
    /// ledger refusals; the caller skips those rows.
    fn apply(self, ledger: &Ledger) -> bool {
        let user_id = UserId(self.user);
        let description = self.description.unwrap_or_default();

        let result = match self.event_type.to_lowercase().as_str() {
            "register" => ledger
                .register_user(user_id, self.amount.unwrap_or(0))
                .map(|_| ()),
            "spend" => {
                // Spends without a key cannot be replayed safely; skip them.
                let Some(key) = self.key.filter(|k| !k.is_empty()) else {
                    return false;
                };
                let Some(amount) = self.amount else {
                    return false;
                };
                ledger
                    .spend(
                        user_id,
                        amount,
                        &description,
                        TransactionId(key),
                        References::none(),
                    )
                    .map(|_| ())
            }
            kind => {
                let source = match kind {
                    "earn" => ActionType::Earn,
                    "purchase" => ActionType::Purchase,
                    "subscription" => ActionType::Subscription,
                    "refund" => ActionType::Refund,
                    "referral_reward" => ActionType::ReferralReward,
                    _ => return false,
                };
                let Some(amount) = self.amount else {
                    return false;
                };
                ledger
                    .earn(user_id, amount, &description, source, References::none())
                    .map(|_| ())
            }
        };

        match result {
            Ok(()) => true,
            Err(_e) => {
                #[cfg(debug_assertions)]
                eprintln!("Skipping event for user {}: {}", self.user, _e);
                false
            }
        }
    }
}

/// Replay ledger events from a CSV reader.
///
/// This function uses streaming parsing to handle arbitrarily large CSV
/// files without loading the entire file into memory. Malformed rows and
/// refused events (unknown user, insufficient balance) are skipped.
///
/// # CSV Format
///
/// Expected columns: `type, user, amount, key, description`
/// - `type`: Event type (register, spend, earn, purchase, subscription,
///   refund, referral_reward)
/// - `user`: User ID (u64)
/// - `amount`: Integer points (signup grant for register; required otherwise)
/// - `key`: Idempotency key (required for spend; a repeated key charges once)
/// - `description`: Free text (optional)
///
/// # Example
///
/// ```csv
/// type,user,amount,key,description
/// register,1,100,,
/// spend,1,5,req-1,AI reply
/// spend,1,5,req-1,AI reply retry
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
pub fn replay_events<R: Read>(reader: R) -> Result<Ledger, csv::Error> {
    let ledger = Ledger::new();

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All) // Handle whitespace in fields like " spend "
        .flexible(true) // Allow missing key/description fields
        .has_headers(true) // Skip first row as header
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        match result {
            Ok(record) => {
                record.apply(&ledger);
            }
            Err(e) => {
                // Skip malformed rows
                #[cfg(debug_assertions)]
                eprintln!("Skipping malformed row: {}", e);
                continue;
            }
        }
    }

    Ok(ledger)
}

/// Output row: one balance per user.
#[derive(Debug, Serialize)]
struct BalanceRow {
    user: u64,
    credits: i64,
}

/// Write final balances to a CSV writer, ordered by user id.
///
/// # CSV Format
///
/// Columns: `user, credits`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_balances<W: Write>(ledger: &Ledger, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    let mut snapshots = ledger.balance_snapshots();
    snapshots.sort_by_key(|snapshot| snapshot.user_id.0);

    for snapshot in snapshots {
        wtr.serialize(BalanceRow {
            user: snapshot.user_id.0,
            credits: snapshot.credits,
        })?;
    }

    // Flush to ensure all data is written
    wtr.flush()?;
    Ok(())
}
