#![allow(dead_code)]

use docmodel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Entity)]
#[document(collection = "teams")]
pub struct Team {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    #[field(required, unique)]
    pub name: String,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Entity)]
#[document(collection = "users", soft_delete)]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    #[field(required, max_length = 32)]
    pub name: String,
    #[field(default = 18, min = 0)]
    pub age: Option<i64>,
    #[field(references = "Team")]
    pub team: Option<ObjectId>,
}

impl User {
    pub fn new(name: &str, age: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            age,
            team: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Entity)]
#[document(audit)]
pub struct Note {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub text: String,
}

/// A context with an empty in-memory store registered as the default connection.
pub async fn context() -> ModelContext {
    let ctx = ModelContext::new();
    docmodel::connect(&ctx, &Config::new("memory://local/app"))
        .await
        .unwrap();
    ctx
}

pub async fn seed_users(users: &Model<User>, count: i64) -> Vec<User> {
    let batch: Vec<User> = (1..=count)
        .map(|age| User::new(&format!("user-{age}"), Some(age)))
        .collect();
    users.clone().create_many(&batch).await.unwrap()
}
