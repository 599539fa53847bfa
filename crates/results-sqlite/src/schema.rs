pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE hosts (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  address         TEXT NOT NULL UNIQUE,
  hostname        TEXT,
  last_seen       TEXT NOT NULL
);

CREATE TABLE ports (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  port            INTEGER NOT NULL CHECK (port BETWEEN 0 AND 65535),
  protocol        TEXT NOT NULL CHECK (protocol IN ('tcp','udp')),
  UNIQUE (port, protocol)
);

CREATE TABLE services (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  name            TEXT NOT NULL,
  version         TEXT
);

CREATE TABLE host_ports (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id         INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
  port_id         INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
  status          TEXT NOT NULL CHECK (status IN ('open','closed','filtered','open|filtered','no-filtered')),
  reason          TEXT NOT NULL,
  service_id      INTEGER REFERENCES services(id),
  banner          BLOB,
  scan_time       TEXT NOT NULL,
  UNIQUE (host_id, port_id)
);

CREATE TABLE os_guesses (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id         INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
  os_name         TEXT NOT NULL,
  method          TEXT NOT NULL,
  confidence      TEXT NOT NULL,
  notes           TEXT NOT NULL
);

CREATE UNIQUE INDEX idx_services_identity ON services(name, IFNULL(version, ''));
CREATE INDEX idx_host_ports_host ON host_ports(host_id);
CREATE INDEX idx_os_guesses_host ON os_guesses(host_id, id);

COMMIT;
"#
;
