use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotkeeper::tenant::TenantManager;
use slotkeeper::wire;

const PASSWORD: &str = "slotkeeper";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotkeeper_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("staff")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client
        .simple_query(sql)
        .await
        .err()
        .unwrap_or_else(|| panic!("{sql}: expected an error"));
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// R1 opens Saturdays 08:00-22:00 at 20000/h with evenings at 1.5x.
/// R2 opens Fridays 22:00-02:00 at 30000/h.
async fn seed(client: &Client) {
    client
        .batch_execute(
            "INSERT INTO resources (id, name, hourly_price) VALUES ('R1', 'Court 1', 20000);
             INSERT INTO schedules (resource_id, weekday, opening, closing) VALUES ('R1', 6, '08:00', '22:00');
             INSERT INTO price_ranges (resource_id, weekday, start_time, end_time, multiplier)
                 VALUES ('R1', 6, '18:00', '22:00', 1.5);
             INSERT INTO resources (id, name, hourly_price) VALUES ('R2', 'Court 2', 30000);
             INSERT INTO schedules (resource_id, weekday, opening, closing) VALUES ('R2', 5, '22:00', '02:00');",
        )
        .await
        .unwrap();
}

fn book_sql(start: &str, last_name: &str, contact: &str) -> String {
    format!(
        "INSERT INTO reservations (resource_id, date, start_time, first_name, last_name, email) \
         VALUES ('R1', '2024-06-01', '{start}', 'Awa', '{last_name}', '{contact}')"
    )
}

fn field<'a>(row: &'a SimpleQueryRow, name: &str) -> &'a str {
    row.get(name).unwrap_or_else(|| panic!("column {name} is NULL"))
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn availability_with_pricing() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    seed(&client).await;

    let slots = rows(
        &client,
        "SELECT * FROM availability WHERE resource_id = 'R1' AND date = '2024-06-01'",
    )
    .await;
    assert_eq!(slots.len(), 14);
    assert_eq!(field(&slots[0], "start_time"), "08:00");
    assert_eq!(field(&slots[0], "end_time"), "09:00");
    assert_eq!(field(&slots[0], "price"), "20000");
    assert_eq!(field(&slots[13], "start_time"), "21:00");
    assert_eq!(field(&slots[13], "price"), "30000");

    let late = rows(
        &client,
        "SELECT * FROM availability WHERE resource_id = 'R2' AND date = '2024-06-07'",
    )
    .await;
    let starts: Vec<_> = late.iter().map(|r| field(r, "start_time")).collect();
    assert_eq!(starts, ["22:00", "23:00", "00:00", "01:00"]);
    assert_eq!(field(&late[3], "end_time"), "02:00");

    // Closed day: no rows, not an error.
    let closed = rows(
        &client,
        "SELECT * FROM availability WHERE resource_id = 'R1' AND date = '2024-06-02'",
    )
    .await;
    assert!(closed.is_empty());
}

#[tokio::test]
async fn booking_conflict_and_guest_lookup() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    seed(&client).await;

    let created = rows(&client, &book_sql("14:00", "Diop", "awa@example.com")).await;
    assert_eq!(created.len(), 1);
    let code = field(&created[0], "booking_code").to_string();
    assert_eq!(code.len(), 6);
    assert_eq!(field(&created[0], "status"), "pending");
    assert_eq!(field(&created[0], "status_label"), "En attente");
    assert_eq!(field(&created[0], "total_price"), "20000");

    assert_eq!(
        sqlstate(&client, &book_sql("14:00", "Fall", "other@example.com")).await,
        "23505"
    );

    let slots = rows(
        &client,
        "SELECT * FROM availability WHERE resource_id = 'R1' AND date = '2024-06-01'",
    )
    .await;
    let taken = slots
        .iter()
        .find(|r| field(r, "start_time") == "14:00")
        .unwrap();
    let free = slots
        .iter()
        .find(|r| field(r, "start_time") == "15:00")
        .unwrap();
    assert_ne!(field(taken, "available"), field(free, "available"));

    let found = rows(
        &client,
        &format!(
            "SELECT * FROM reservations WHERE booking_code = '{}' AND contact = 'AWA@'",
            code.to_lowercase()
        ),
    )
    .await;
    assert_eq!(field(&found[0], "booking_code"), code);

    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "SELECT * FROM reservations WHERE booking_code = '{code}' AND contact = 'notmatching@x.com'"
            ),
        )
        .await,
        "42501"
    );
    assert_eq!(
        sqlstate(&client, "SELECT * FROM reservations WHERE booking_code = 'ZZZZZZ'").await,
        "P0002"
    );
}

#[tokio::test]
async fn lifecycle_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    seed(&client).await;

    let created = rows(&client, &book_sql("10:00", "Diop", "awa@example.com")).await;
    let id = field(&created[0], "id").to_string();
    let transition = |status: &str, role: &str| {
        format!(
            "INSERT INTO status_changes (reservation_id, status, actor, role) \
             VALUES ('{id}', '{status}', 'actor-1', '{role}')"
        )
    };

    assert_eq!(sqlstate(&client, &transition("confirmed", "guest")).await, "42501");
    assert_eq!(sqlstate(&client, &transition("Utilisé", "gerant")).await, "55000");

    let confirmed = rows(&client, &transition("Confirmé", "gerant")).await;
    assert_eq!(field(&confirmed[0], "status"), "confirmed");
    let history: serde_json::Value = serde_json::from_str(field(&confirmed[0], "history")).unwrap();
    assert_eq!(history[0]["from"], "pending");
    assert_eq!(history[0]["role"], "manager");

    let paid = rows(
        &client,
        &format!(
            "INSERT INTO status_changes (reservation_id, status, actor, role, payment_ref) \
             VALUES ('{id}', 'paid', 'owner-1', 'proprio', 'PAY-42')"
        ),
    )
    .await;
    assert_eq!(field(&paid[0], "status_label"), "Payé");
    assert_eq!(field(&paid[0], "payment_ref"), "PAY-42");

    // Paid reservations cannot be cancelled.
    assert_eq!(sqlstate(&client, &transition("cancelled", "admin")).await, "55000");

    let fetched = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(field(&fetched[0], "status"), "paid");
}

#[tokio::test]
async fn cancelling_frees_the_slot() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    seed(&client).await;

    let created = rows(&client, &book_sql("09:00", "Diop", "awa@example.com")).await;
    let id = field(&created[0], "id").to_string();
    rows(
        &client,
        &format!(
            "INSERT INTO status_changes (reservation_id, status, actor, role) \
             VALUES ('{id}', 'Annulé', 'guest-1', 'guest')"
        ),
    )
    .await;

    let rebooked = rows(&client, &book_sql("09:00", "Fall", "fall@example.com")).await;
    assert_ne!(field(&rebooked[0], "id"), id);
}

#[tokio::test]
async fn staff_listing_pages() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    seed(&client).await;

    for (start, name) in [("08:00", "Ba"), ("09:00", "Sy"), ("10:00", "Ka")] {
        rows(&client, &book_sql(start, name, "guest@example.com")).await;
    }

    let page = rows(
        &client,
        "SELECT * FROM reservations WHERE resource_id = 'R1' AND page = 1 AND page_size = 2",
    )
    .await;
    assert_eq!(page.len(), 2);
    assert_eq!(field(&page[0], "total_count"), "3");

    let search = rows(&client, "SELECT * FROM reservations WHERE search = 'awa sy'").await;
    assert_eq!(search.len(), 1);
    assert_eq!(field(&search[0], "start_time"), "09:00");

    let none = rows(&client, "SELECT * FROM reservations WHERE status = 'Payé'").await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn rejected_statements() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    seed(&client).await;

    assert_eq!(sqlstate(&client, "DELETE FROM reservations").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM bookings").await, "42601");
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO price_ranges (resource_id, weekday, start_time, end_time, multiplier) \
             VALUES ('R1', 0, '10:00', '12:00', 2)"
        )
        .await,
        "XX001"
    );
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO reservations (resource_id, date, start_time, first_name, last_name, phone, email) \
             VALUES ('R1', '2024-06-01', '11:00', 'Awa', 'Diop', '+221770000000', 'awa@example.com')"
        )
        .await,
        "22023"
    );
}

#[tokio::test]
async fn tenants_are_isolated() {
    let addr = start_test_server().await;
    let club = connect(addr, "club").await;
    seed(&club).await;

    let other = connect(addr, "other_club").await;
    assert_eq!(
        sqlstate(
            &other,
            "SELECT * FROM availability WHERE resource_id = 'R1' AND date = '2024-06-01'"
        )
        .await,
        "P0002"
    );
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    seed(&client).await;

    let created = rows(&client, &book_sql("16:00", "O''Neil", "oneil@example.com")).await;
    let code = field(&created[0], "booking_code").to_string();

    let found = client
        .query(
            "SELECT * FROM reservations WHERE booking_code = $1 AND contact = $2",
            &[&code, &"oneil".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let last_name: String = found[0].get("last_name");
    assert_eq!(last_name, "O'Neil");
    let label: String = found[0].get("status_label");
    assert_eq!(label, "En attente");
}

#[tokio::test]
async fn bound_values_containing_placeholders() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    seed(&client).await;

    let created = client
        .query(
            "INSERT INTO reservations (resource_id, date, start_time, first_name, last_name, email) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &"R1".to_string(),
                &"2024-06-01".to_string(),
                &"12:00".to_string(),
                &"Price$1".to_string(),
                &"D'$2".to_string(),
                &"price@example.com".to_string(),
            ],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let first_name: String = created[0].get("first_name");
    let last_name: String = created[0].get("last_name");
    assert_eq!(first_name, "Price$1");
    assert_eq!(last_name, "D'$2");
    let resource_id: String = created[0].get("resource_id");
    assert_eq!(resource_id, "R1");
}
