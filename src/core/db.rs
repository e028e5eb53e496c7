//! MySQL bootstrap statements built from decrypted credentials.
//!
//! Values are first made safe as SQL literals, then the whole statement is
//! escaped once more for the double-quoted `mysql -e` argument.

use crate::script::Line;
use crate::secrets::DatabaseCredentials;

const DATABASE_HOST: &str = "localhost";

/// SQL string literal: single-quoted, `'` doubled, `\` escaped.
pub fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// SQL identifier: backtick-quoted with embedded backticks doubled.
pub fn sql_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

fn account(username: &str) -> String {
    format!("{}@{}", sql_string(username), sql_string(DATABASE_HOST))
}

/// Idempotent statements creating the database and user and granting access.
pub fn bootstrap_sql(creds: &DatabaseCredentials) -> String {
    let database = sql_identifier(&creds.database);
    let account = account(&creds.username);

    [
        format!("CREATE DATABASE IF NOT EXISTS {};", database),
        format!(
            "CREATE USER IF NOT EXISTS {} IDENTIFIED BY {};",
            account,
            sql_string(&creds.password)
        ),
        format!("GRANT ALL PRIVILEGES ON {}.* TO {};", database, account),
        "FLUSH PRIVILEGES;".to_string(),
    ]
    .join("\n")
}

pub fn bootstrap_command(creds: &DatabaseCredentials) -> String {
    Line::new("sudo mysql -e ").dq(&bootstrap_sql(creds)).build()
}

/// Query printing 1 when the database exists and the user holds a grant on it.
pub fn provisioned_sql(creds: &DatabaseCredentials) -> String {
    let database = sql_string(&creds.database);
    format!(
        "SELECT EXISTS(SELECT 1 FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = {db}) \
         AND EXISTS(SELECT 1 FROM mysql.db WHERE Db = {db} AND User = {user} AND Host = {host});",
        db = database,
        user = sql_string(&creds.username),
        host = sql_string(DATABASE_HOST),
    )
}

pub fn provisioned_probe(creds: &DatabaseCredentials) -> String {
    Line::new("test \"$(sudo mysql -N -B -e ")
        .dq(&provisioned_sql(creds))
        .lit(")\" = 1")
        .build()
}
