use super::CarrierStore;
use crate::{
    error::EngineResult,
    normalize::normalize_name,
    rules::PARTIAL_EVALUATION,
    scoring_stage::CarrierScore,
    snapshot::{Carrier, Dataset, DatasetSnapshot, InsurancePolicy, OperatingStatus, PppLoan, PppTotals, RosterEntry},
    types::{AddressHash, DotNumber},
};
use rusqlite::{params, types::Type, Connection, OptionalExtension};

// ── Row mappers ─────────────────────────────────────────────────────

const CARRIER_COLUMNS: &str = "c.dot_number, c.legal_name, c.physical_address, c.physical_city,
        c.physical_state, c.physical_zip, c.mailing_country, c.phone, c.operating_status,
        c.authority_granted, c.authority_revoked, c.revocation_pending, c.insurance_lapse_date,
        c.power_units, c.total_inspections, c.total_crashes, c.fatal_crashes,
        c.vehicle_oos_rate, c.driver_oos_rate, c.eld_violations, c.latitude, c.longitude,
        c.address_hash";

fn carrier_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Carrier> {
    let status: String = row.get(8)?;
    let status = status
        .parse::<OperatingStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
    Ok(Carrier {
        dot_number: row.get(0)?,
        legal_name: row.get(1)?,
        physical_address: row.get(2)?,
        physical_city: row.get(3)?,
        physical_state: row.get(4)?,
        physical_zip: row.get(5)?,
        mailing_country: row.get(6)?,
        phone: row.get(7)?,
        status,
        authority_granted: row.get(9)?,
        authority_revoked: row.get(10)?,
        revocation_pending: row.get::<_, i32>(11)? != 0,
        insurance_lapse_date: row.get(12)?,
        power_units: row.get(13)?,
        total_inspections: row.get(14)?,
        total_crashes: row.get(15)?,
        fatal_crashes: row.get(16)?,
        // SQLite has no NaN; an absent rate reads as zero.
        vehicle_oos_rate: row.get::<_, Option<f64>>(17)?.unwrap_or(0.0),
        driver_oos_rate: row.get::<_, Option<f64>>(18)?.unwrap_or(0.0),
        eld_violations: row.get(19)?,
        latitude: row.get(20)?,
        longitude: row.get(21)?,
        address_hash: row.get(22)?,
        ppp: PppTotals {
            loan_count: row.get(23)?,
            loan_total: row.get(24)?,
            forgiven_total: row.get(25)?,
        },
    })
}

fn score_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<CarrierScore> {
    let risk_flags: Vec<String> = super::json_column(row, 2)?;
    Ok(CarrierScore {
        dot_number: row.get(0)?,
        risk_score: row.get::<_, i64>(1)? as u32,
        partial: risk_flags.iter().any(|f| f == PARTIAL_EVALUATION),
        risk_flags,
    })
}

// ── Writers usable inside a transaction ─────────────────────────────

/// Insert or update a registry row. The address hash is always recomputed
/// here from the address fields; callers cannot supply their own. Score
/// columns are left alone.
fn upsert_carrier_row(conn: &Connection, c: &Carrier) -> EngineResult<()> {
    let mut c = c.clone();
    c.rehash();
    conn.execute(
        "INSERT INTO carrier (
            dot_number, legal_name, physical_address, physical_city, physical_state,
            physical_zip, mailing_country, phone, operating_status, authority_granted,
            authority_revoked, revocation_pending, insurance_lapse_date, power_units,
            total_inspections, total_crashes, fatal_crashes, vehicle_oos_rate,
            driver_oos_rate, eld_violations, latitude, longitude, address_hash
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                   ?17, ?18, ?19, ?20, ?21, ?22, ?23)
         ON CONFLICT (dot_number) DO UPDATE SET
            legal_name = excluded.legal_name,
            physical_address = excluded.physical_address,
            physical_city = excluded.physical_city,
            physical_state = excluded.physical_state,
            physical_zip = excluded.physical_zip,
            mailing_country = excluded.mailing_country,
            phone = excluded.phone,
            operating_status = excluded.operating_status,
            authority_granted = excluded.authority_granted,
            authority_revoked = excluded.authority_revoked,
            revocation_pending = excluded.revocation_pending,
            insurance_lapse_date = excluded.insurance_lapse_date,
            power_units = excluded.power_units,
            total_inspections = excluded.total_inspections,
            total_crashes = excluded.total_crashes,
            fatal_crashes = excluded.fatal_crashes,
            vehicle_oos_rate = excluded.vehicle_oos_rate,
            driver_oos_rate = excluded.driver_oos_rate,
            eld_violations = excluded.eld_violations,
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            address_hash = excluded.address_hash",
        params![
            c.dot_number,
            &c.legal_name,
            c.physical_address.as_deref(),
            c.physical_city.as_deref(),
            c.physical_state.as_deref(),
            c.physical_zip.as_deref(),
            c.mailing_country.as_deref(),
            c.phone.as_deref(),
            c.status.as_str(),
            c.authority_granted,
            c.authority_revoked,
            if c.revocation_pending { 1i32 } else { 0i32 },
            c.insurance_lapse_date,
            c.power_units,
            c.total_inspections,
            c.total_crashes,
            c.fatal_crashes,
            c.vehicle_oos_rate,
            c.driver_oos_rate,
            c.eld_violations,
            c.latitude,
            c.longitude,
            &c.address_hash,
        ],
    )?;
    Ok(())
}

fn insert_roster_row(conn: &Connection, r: &RosterEntry) -> EngineResult<()> {
    let normalized = if r.normalized_name.is_empty() {
        normalize_name(&r.raw_name)
    } else {
        r.normalized_name.clone()
    };
    conn.execute(
        "INSERT INTO officer_roster (dot_number, raw_name, normalized_name, position, phone, email)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            r.dot_number,
            &r.raw_name,
            normalized,
            r.position.as_deref(),
            r.phone.as_deref(),
            r.email.as_deref(),
        ],
    )?;
    Ok(())
}

fn insert_ppp_row(conn: &Connection, loan: &PppLoan) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO ppp_loan (loan_id, matched_dot_number, borrower_name, loan_amount, forgiven_amount)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (loan_id) DO UPDATE SET
            matched_dot_number = excluded.matched_dot_number,
            borrower_name = excluded.borrower_name,
            loan_amount = excluded.loan_amount,
            forgiven_amount = excluded.forgiven_amount",
        params![
            &loan.loan_id,
            loan.matched_dot_number,
            &loan.borrower_name,
            loan.loan_amount,
            loan.forgiven_amount,
        ],
    )?;
    Ok(())
}

fn insert_insurance_row(conn: &Connection, p: &InsurancePolicy) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO insurance_policy (
            dot_number, insurance_company, policy_number, effective_date, cancel_effective_date
         ) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            p.dot_number,
            &p.insurance_company,
            p.policy_number.as_deref(),
            p.effective_date,
            p.cancel_effective_date,
        ],
    )?;
    Ok(())
}

impl CarrierStore {
    // ── Inputs ─────────────────────────────────────────────────────

    pub fn upsert_carrier(&self, c: &Carrier) -> EngineResult<()> {
        upsert_carrier_row(&self.conn, c)
    }

    pub fn insert_roster_entry(&self, r: &RosterEntry) -> EngineResult<()> {
        insert_roster_row(&self.conn, r)
    }

    pub fn upsert_ppp_loan(&self, loan: &PppLoan) -> EngineResult<()> {
        insert_ppp_row(&self.conn, loan)
    }

    pub fn insert_insurance_policy(&self, policy: &InsurancePolicy) -> EngineResult<()> {
        insert_insurance_row(&self.conn, policy)
    }

    /// Load a whole dataset document in one transaction.
    pub fn load_dataset(&self, dataset: &Dataset) -> EngineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for c in &dataset.carriers {
            upsert_carrier_row(&tx, c)?;
        }
        for r in &dataset.roster {
            insert_roster_row(&tx, r)?;
        }
        for loan in &dataset.ppp_loans {
            insert_ppp_row(&tx, loan)?;
        }
        for policy in &dataset.insurance {
            insert_insurance_row(&tx, policy)?;
        }
        tx.commit()?;
        log::info!(
            "dataset loaded: {} carriers, {} roster rows, {} PPP loans, {} insurance filings",
            dataset.carriers.len(),
            dataset.roster.len(),
            dataset.ppp_loans.len(),
            dataset.insurance.len()
        );
        Ok(())
    }

    /// Read the full input of a run. PPP totals are aggregated from the
    /// loans matched to each carrier. The stored `address_hash` column is
    /// not trusted: the snapshot recomputes every hash.
    pub fn load_snapshot(&self) -> EngineResult<DatasetSnapshot> {
        let sql = format!(
            "SELECT {CARRIER_COLUMNS},
                    COALESCE(p.loan_count, 0), COALESCE(p.loan_total, 0.0),
                    COALESCE(p.forgiven_total, 0.0)
             FROM carrier c
             LEFT JOIN (
                SELECT matched_dot_number AS dot_number,
                       COUNT(*) AS loan_count,
                       SUM(loan_amount) AS loan_total,
                       SUM(forgiven_amount) AS forgiven_total
                FROM ppp_loan
                WHERE matched_dot_number IS NOT NULL
                GROUP BY matched_dot_number
             ) p ON p.dot_number = c.dot_number
             ORDER BY c.dot_number ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let carriers = stmt
            .query_map([], carrier_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT dot_number, raw_name, normalized_name, position, phone, email
             FROM officer_roster ORDER BY id ASC",
        )?;
        let roster = stmt
            .query_map([], |row| {
                Ok(RosterEntry {
                    dot_number: row.get(0)?,
                    raw_name: row.get(1)?,
                    normalized_name: row.get(2)?,
                    position: row.get(3)?,
                    phone: row.get(4)?,
                    email: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT dot_number, insurance_company, policy_number, effective_date, cancel_effective_date
             FROM insurance_policy ORDER BY id ASC",
        )?;
        let insurance = stmt
            .query_map([], |row| {
                Ok(InsurancePolicy {
                    dot_number: row.get(0)?,
                    insurance_company: row.get(1)?,
                    policy_number: row.get(2)?,
                    effective_date: row.get(3)?,
                    cancel_effective_date: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DatasetSnapshot::new(carriers, roster).with_insurance(insurance))
    }

    pub fn carrier_count(&self) -> EngineResult<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM carrier", [], |r| r.get(0))?)
    }

    /// The `address_hash` column as stored, before any recompute.
    pub fn stored_address_hash(&self, dot: DotNumber) -> EngineResult<Option<AddressHash>> {
        self.conn
            .query_row(
                "SELECT address_hash FROM carrier WHERE dot_number = ?1",
                params![dot],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    // ── Scores ─────────────────────────────────────────────────────

    pub fn carrier_score(&self, dot: DotNumber) -> EngineResult<Option<CarrierScore>> {
        self.conn
            .query_row(
                "SELECT dot_number, risk_score, risk_flags FROM carrier WHERE dot_number = ?1",
                params![dot],
                score_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All scores in DOT order.
    pub fn carrier_scores(&self) -> EngineResult<Vec<CarrierScore>> {
        let mut stmt = self.conn.prepare(
            "SELECT dot_number, risk_score, risk_flags FROM carrier ORDER BY dot_number ASC",
        )?;
        let rows = stmt.query_map([], score_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
