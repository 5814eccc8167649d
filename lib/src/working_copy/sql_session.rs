// Copyright 2024 The Meridian Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]
//! The thin SQL seam every table working-copy backend connects through.
//!
//! One session is one connection; every user command runs inside exactly one
//! transaction on it. Parameter binding uses the portable [`SqlValue`] type;
//! each driver converts to its native parameter form.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("Cannot connect to the working copy: {message}")]
    Connect { message: String },
    #[error("Working copy query failed: {message}")]
    Query { message: String },
}

impl SqlError {
    pub fn query(err: impl std::fmt::Display) -> Self {
        Self::Query {
            message: err.to_string(),
        }
    }

    pub fn connect(err: impl std::fmt::Display) -> Self {
        Self::Connect {
            message: err.to_string(),
        }
    }
}

/// A database value in transit, either as a bound parameter or a fetched
/// cell.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

pub type SqlRow = Vec<SqlValue>;

/// One connection to a working-copy database.
pub trait SqlSession {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, SqlError>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SqlError>;

    fn begin(&mut self) -> Result<(), SqlError>;

    fn commit(&mut self) -> Result<(), SqlError>;

    fn rollback(&mut self) -> Result<(), SqlError>;

    fn query_one(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>, SqlError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    fn scalar_int(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>, SqlError> {
        Ok(self
            .query_one(sql, params)?
            .and_then(|row| row.first().and_then(SqlValue::as_int)))
    }
}

/// The placeholder style a dialect binds parameters with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` — SQLite, MySQL.
    Question,
    /// `$1`, `$2`, … — PostgreSQL.
    Dollar,
    /// `@P1`, `@P2`, … — SQL Server.
    AtP,
}

impl PlaceholderStyle {
    pub fn placeholder(&self, index_1based: usize) -> String {
        match self {
            Self::Question => "?".to_string(),
            Self::Dollar => format!("${index_1based}"),
            Self::AtP => format!("@P{index_1based}"),
        }
    }

    /// A comma-separated placeholder list for `n` parameters starting at
    /// parameter `start` (1-based).
    pub fn placeholders(&self, start: usize, n: usize) -> String {
        (0..n)
            .map(|i| self.placeholder(start + i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(PlaceholderStyle::Question.placeholders(1, 3), "?, ?, ?");
        assert_eq!(PlaceholderStyle::Dollar.placeholders(2, 2), "$2, $3");
        assert_eq!(PlaceholderStyle::AtP.placeholder(1), "@P1");
    }
}
