use anyhow::Result;

use crate::config::TokenStore;

pub(crate) fn cmd_login(tokens: &TokenStore, token: &str, json: bool) -> Result<()> {
    tokens.save(token)?;

    if json {
        println!("{}", serde_json::json!({ "logged_in": true }));
    } else {
        println!("Token saved. Requests will be sent as this user.");
    }
    Ok(())
}

pub(crate) fn cmd_logout(tokens: &TokenStore, json: bool) -> Result<()> {
    let had_token = tokens.clear()?;

    if json {
        println!("{}", serde_json::json!({ "logged_out": had_token }));
    } else if had_token {
        println!("Logged out.");
    } else {
        eprintln!("Not logged in.");
    }
    Ok(())
}
