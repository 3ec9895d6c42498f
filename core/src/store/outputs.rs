use super::{confidence_column, json_column, to_json, CarrierStore};
use crate::{
    address_cluster_stage::AddressCluster,
    chameleon_stage::ChameleonPair,
    engine::{CorrelationOutput, EngineRunRecord},
    error::EngineResult,
    event::EventLogEntry,
    fraud_ring_stage::FraudRing,
    identity_stage::IdentityCluster,
    insurance_stats_stage::InsuranceCompanyStats,
    peer_benchmark_stage::{FleetSizeBucket, PeerBenchmark},
    snapshot::insurer_key,
    types::{AddressHash, DotNumber},
};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};

// ── Row mappers ─────────────────────────────────────────────────────

fn address_cluster_row_mapper(row: &Row<'_>) -> rusqlite::Result<AddressCluster> {
    Ok(AddressCluster {
        address_hash: row.get(0)?,
        member_dots: json_column(row, 1)?,
        carrier_count: row.get::<_, i64>(2)? as usize,
        active_count: row.get::<_, i64>(3)? as usize,
        centroid_lat: row.get(4)?,
        centroid_lon: row.get(5)?,
        total_crashes: row.get(6)?,
        total_inspections: row.get(7)?,
        avg_vehicle_oos_rate: row.get(8)?,
        street: row.get(9)?,
        city: row.get(10)?,
        state: row.get(11)?,
        zip: row.get(12)?,
    })
}

fn identity_cluster_row_mapper(row: &Row<'_>) -> rusqlite::Result<IdentityCluster> {
    Ok(IdentityCluster {
        officer_name: row.get(0)?,
        cluster_index: row.get::<_, i64>(1)? as usize,
        member_dots: json_column(row, 2)?,
        link_signals: json_column(row, 3)?,
        carrier_count: row.get::<_, i64>(4)? as usize,
        total_crashes: row.get(5)?,
        fatal_crashes: row.get(6)?,
        power_units: row.get(7)?,
        avg_risk_score: row.get(8)?,
        ppp_total: row.get(9)?,
        states: json_column(row, 10)?,
    })
}

fn chameleon_pair_row_mapper(row: &Row<'_>) -> rusqlite::Result<ChameleonPair> {
    Ok(ChameleonPair {
        predecessor_dot: row.get(0)?,
        successor_dot: row.get(1)?,
        deactivation_date: row.get(2)?,
        activation_date: row.get(3)?,
        days_gap: row.get(4)?,
        match_signals: json_column(row, 5)?,
        signal_count: row.get::<_, i64>(6)? as usize,
        confidence: confidence_column(row, 7)?,
    })
}

fn fraud_ring_row_mapper(row: &Row<'_>) -> rusqlite::Result<FraudRing> {
    Ok(FraudRing {
        ring_id: row.get::<_, i64>(0)? as usize,
        member_dots: json_column(row, 1)?,
        officer_names: json_column(row, 2)?,
        shared_addresses: json_column(row, 3)?,
        carrier_count: row.get::<_, i64>(4)? as usize,
        active_count: row.get::<_, i64>(5)? as usize,
        total_crashes: row.get(6)?,
        total_fatalities: row.get(7)?,
        combined_risk: row.get::<_, i64>(8)? as u64,
        edge_count: row.get::<_, i64>(9)? as usize,
        corroborated_edges: row.get::<_, i64>(10)? as usize,
        confidence: confidence_column(row, 11)?,
    })
}

fn peer_benchmark_row_mapper(row: &Row<'_>) -> rusqlite::Result<PeerBenchmark> {
    let bucket: String = row.get(1)?;
    let fleet_size_bucket = bucket
        .parse::<FleetSizeBucket>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?;
    Ok(PeerBenchmark {
        dot_number: row.get(0)?,
        fleet_size_bucket,
        peer_crash_percentile: row.get(2)?,
        peer_oos_percentile: row.get(3)?,
    })
}

fn insurance_stats_row_mapper(row: &Row<'_>) -> rusqlite::Result<InsuranceCompanyStats> {
    Ok(InsuranceCompanyStats {
        insurance_company: row.get(0)?,
        carriers_insured: row.get::<_, i64>(1)? as usize,
        total_policies: row.get::<_, i64>(2)? as usize,
        cancellations: row.get::<_, i64>(3)? as usize,
        cancellation_rate: row.get(4)?,
        high_risk_carriers: row.get::<_, i64>(5)? as usize,
        avg_carrier_risk: row.get(6)?,
        total_crashes: row.get(7)?,
    })
}

const INSURANCE_STATS_COLUMNS: &str = "insurance_company, carriers_insured, total_policies, cancellations,
        cancellation_rate, high_risk_carriers, avg_carrier_risk, total_crashes";

fn engine_run_row_mapper(row: &Row<'_>) -> rusqlite::Result<EngineRunRecord> {
    Ok(EngineRunRecord {
        run_id: row.get(0)?,
        as_of: row.get(1)?,
        rule_table_version: row.get(2)?,
        rule_table_fingerprint: row.get(3)?,
        carrier_count: row.get::<_, i64>(4)? as usize,
        flagged_carriers: row.get::<_, i64>(5)? as usize,
        partial_evaluations: row.get::<_, i64>(6)? as usize,
        address_cluster_count: row.get::<_, i64>(7)? as usize,
        identity_cluster_count: row.get::<_, i64>(8)? as usize,
        chameleon_pair_count: row.get::<_, i64>(9)? as usize,
        fraud_ring_count: row.get::<_, i64>(10)? as usize,
        benchmarked_carriers: row.get::<_, i64>(11)? as usize,
        insurance_company_count: row.get::<_, i64>(12)? as usize,
        published_at: row.get(13)?,
    })
}

// ── Publish ─────────────────────────────────────────────────────────

fn write_address_clusters(conn: &Connection, clusters: &[AddressCluster]) -> EngineResult<()> {
    conn.execute("DELETE FROM address_cluster", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO address_cluster (
            address_hash, member_dots, carrier_count, active_count, centroid_lat,
            centroid_lon, total_crashes, total_inspections, avg_vehicle_oos_rate,
            street, city, state, zip
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )?;
    for c in clusters {
        stmt.execute(params![
            &c.address_hash,
            to_json(&c.member_dots)?,
            c.carrier_count as i64,
            c.active_count as i64,
            c.centroid_lat,
            c.centroid_lon,
            c.total_crashes,
            c.total_inspections,
            c.avg_vehicle_oos_rate,
            c.street.as_deref(),
            c.city.as_deref(),
            c.state.as_deref(),
            c.zip.as_deref(),
        ])?;
    }
    Ok(())
}

fn write_identity_clusters(conn: &Connection, clusters: &[IdentityCluster]) -> EngineResult<()> {
    conn.execute("DELETE FROM officer_identity_cluster", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO officer_identity_cluster (
            officer_name, cluster_index, member_dots, link_signals, carrier_count,
            total_crashes, fatal_crashes, power_units, avg_risk_score, ppp_total, states
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for c in clusters {
        stmt.execute(params![
            &c.officer_name,
            c.cluster_index as i64,
            to_json(&c.member_dots)?,
            to_json(&c.link_signals)?,
            c.carrier_count as i64,
            c.total_crashes,
            c.fatal_crashes,
            c.power_units,
            c.avg_risk_score,
            c.ppp_total,
            to_json(&c.states)?,
        ])?;
    }
    Ok(())
}

fn write_chameleon_pairs(conn: &Connection, pairs: &[ChameleonPair]) -> EngineResult<()> {
    conn.execute("DELETE FROM chameleon_pair", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO chameleon_pair (
            predecessor_dot, successor_dot, deactivation_date, activation_date,
            days_gap, match_signals, signal_count, confidence
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for p in pairs {
        stmt.execute(params![
            p.predecessor_dot,
            p.successor_dot,
            p.deactivation_date,
            p.activation_date,
            p.days_gap,
            to_json(&p.match_signals)?,
            p.signal_count as i64,
            p.confidence.as_str(),
        ])?;
    }
    Ok(())
}

fn write_fraud_rings(conn: &Connection, rings: &[FraudRing]) -> EngineResult<()> {
    conn.execute("DELETE FROM fraud_ring", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO fraud_ring (
            ring_id, member_dots, officer_names, shared_addresses, carrier_count,
            active_count, total_crashes, total_fatalities, combined_risk, edge_count,
            corroborated_edges, confidence
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for r in rings {
        stmt.execute(params![
            r.ring_id as i64,
            to_json(&r.member_dots)?,
            to_json(&r.officer_names)?,
            to_json(&r.shared_addresses)?,
            r.carrier_count as i64,
            r.active_count as i64,
            r.total_crashes,
            r.total_fatalities,
            r.combined_risk as i64,
            r.edge_count as i64,
            r.corroborated_edges as i64,
            r.confidence.as_str(),
        ])?;
    }
    Ok(())
}

fn write_peer_benchmarks(conn: &Connection, benchmarks: &[PeerBenchmark]) -> EngineResult<()> {
    conn.execute("DELETE FROM peer_benchmark", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO peer_benchmark (dot_number, fleet_size_bucket, peer_crash_percentile, peer_oos_percentile)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for b in benchmarks {
        stmt.execute(params![
            b.dot_number,
            b.fleet_size_bucket.as_str(),
            b.peer_crash_percentile,
            b.peer_oos_percentile,
        ])?;
    }
    Ok(())
}

fn write_insurance_stats(conn: &Connection, stats: &[InsuranceCompanyStats]) -> EngineResult<()> {
    conn.execute("DELETE FROM insurance_company_stats", [])?;
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO insurance_company_stats ({INSURANCE_STATS_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
    ))?;
    for s in stats {
        stmt.execute(params![
            &s.insurance_company,
            s.carriers_insured as i64,
            s.total_policies as i64,
            s.cancellations as i64,
            s.cancellation_rate,
            s.high_risk_carriers as i64,
            s.avg_carrier_risk,
            s.total_crashes,
        ])?;
    }
    Ok(())
}

/// Write back hashes the snapshot had to recompute, so readers joining on
/// `carrier.address_hash` agree with the published clusters.
fn write_address_hashes(conn: &Connection, rehashed: &[(DotNumber, AddressHash)]) -> EngineResult<()> {
    let mut stmt = conn.prepare("UPDATE carrier SET address_hash = ?1 WHERE dot_number = ?2")?;
    for (dot, hash) in rehashed {
        stmt.execute(params![hash, dot])?;
    }
    Ok(())
}

/// Full reset of the score columns: carriers absent from this run's
/// output drop back to zero.
fn write_scores(conn: &Connection, output: &CorrelationOutput) -> EngineResult<()> {
    conn.execute("UPDATE carrier SET risk_score = 0, risk_flags = '[]'", [])?;
    let mut stmt = conn.prepare("UPDATE carrier SET risk_score = ?1, risk_flags = ?2 WHERE dot_number = ?3")?;
    for s in output.scores.iter().filter(|s| s.risk_score > 0 || !s.risk_flags.is_empty()) {
        stmt.execute(params![s.risk_score, to_json(&s.risk_flags)?, s.dot_number])?;
    }
    Ok(())
}

impl CarrierStore {
    /// Replace every derived table with this run's output, update the
    /// carrier score columns, record the run and its events. One
    /// transaction: on any error the previous run stays current.
    ///
    /// Returns the publish timestamp recorded on the run.
    pub fn publish_run(&self, record: &EngineRunRecord, output: &CorrelationOutput) -> EngineResult<String> {
        let published_at = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;

        write_address_clusters(&tx, &output.address_clusters)?;
        write_identity_clusters(&tx, &output.identity_clusters)?;
        write_chameleon_pairs(&tx, &output.chameleon_pairs)?;
        write_fraud_rings(&tx, &output.fraud_rings)?;
        write_scores(&tx, output)?;
        write_peer_benchmarks(&tx, &output.peer_benchmarks)?;
        write_insurance_stats(&tx, &output.insurance_stats)?;
        write_address_hashes(&tx, &output.rehashed)?;

        tx.execute(
            "INSERT INTO engine_run (
                run_id, as_of, rule_table_version, rule_table_fingerprint, carrier_count,
                flagged_carriers, partial_evaluations, address_cluster_count,
                identity_cluster_count, chameleon_pair_count, fraud_ring_count,
                benchmarked_carriers, insurance_company_count, published_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                &record.run_id,
                record.as_of,
                &record.rule_table_version,
                &record.rule_table_fingerprint,
                record.carrier_count as i64,
                record.flagged_carriers as i64,
                record.partial_evaluations as i64,
                record.address_cluster_count as i64,
                record.identity_cluster_count as i64,
                record.chameleon_pair_count as i64,
                record.fraud_ring_count as i64,
                record.benchmarked_carriers as i64,
                record.insurance_company_count as i64,
                &published_at,
            ],
        )?;

        let mut stmt = tx.prepare(
            "INSERT INTO event_log (run_id, seq, stage, event_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (seq, e) in output.events.iter().enumerate() {
            let entry = EventLogEntry::from_stage_event(&record.run_id, seq as i64, e)?;
            stmt.execute(params![
                entry.run_id,
                entry.seq,
                entry.stage,
                entry.event_type,
                entry.payload,
            ])?;
        }
        drop(stmt);

        tx.commit()?;
        Ok(published_at)
    }

    // ── Readers ────────────────────────────────────────────────────

    /// Carrier count descending, then hash.
    pub fn address_clusters(&self) -> EngineResult<Vec<AddressCluster>> {
        let mut stmt = self.conn.prepare(
            "SELECT address_hash, member_dots, carrier_count, active_count, centroid_lat,
                    centroid_lon, total_crashes, total_inspections, avg_vehicle_oos_rate,
                    street, city, state, zip
             FROM address_cluster ORDER BY carrier_count DESC, address_hash ASC",
        )?;
        let rows = stmt.query_map([], address_cluster_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn identity_clusters(&self) -> EngineResult<Vec<IdentityCluster>> {
        let mut stmt = self.conn.prepare(
            "SELECT officer_name, cluster_index, member_dots, link_signals, carrier_count,
                    total_crashes, fatal_crashes, power_units, avg_risk_score, ppp_total, states
             FROM officer_identity_cluster ORDER BY officer_name ASC, cluster_index ASC",
        )?;
        let rows = stmt.query_map([], identity_cluster_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn identity_clusters_for_name(&self, normalized_name: &str) -> EngineResult<Vec<IdentityCluster>> {
        let mut stmt = self.conn.prepare(
            "SELECT officer_name, cluster_index, member_dots, link_signals, carrier_count,
                    total_crashes, fatal_crashes, power_units, avg_risk_score, ppp_total, states
             FROM officer_identity_cluster WHERE officer_name = ?1 ORDER BY cluster_index ASC",
        )?;
        let rows = stmt.query_map(params![normalized_name], identity_cluster_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn chameleon_pairs(&self) -> EngineResult<Vec<ChameleonPair>> {
        let mut stmt = self.conn.prepare(
            "SELECT predecessor_dot, successor_dot, deactivation_date, activation_date,
                    days_gap, match_signals, signal_count, confidence
             FROM chameleon_pair ORDER BY predecessor_dot ASC, successor_dot ASC",
        )?;
        let rows = stmt.query_map([], chameleon_pair_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn fraud_rings(&self) -> EngineResult<Vec<FraudRing>> {
        let mut stmt = self.conn.prepare(
            "SELECT ring_id, member_dots, officer_names, shared_addresses, carrier_count,
                    active_count, total_crashes, total_fatalities, combined_risk, edge_count,
                    corroborated_edges, confidence
             FROM fraud_ring ORDER BY ring_id ASC",
        )?;
        let rows = stmt.query_map([], fraud_ring_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// One row per carrier, DOT order.
    pub fn peer_benchmarks(&self) -> EngineResult<Vec<PeerBenchmark>> {
        let mut stmt = self.conn.prepare(
            "SELECT dot_number, fleet_size_bucket, peer_crash_percentile, peer_oos_percentile
             FROM peer_benchmark ORDER BY dot_number ASC",
        )?;
        let rows = stmt.query_map([], peer_benchmark_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn peer_benchmark(&self, dot: DotNumber) -> EngineResult<Option<PeerBenchmark>> {
        self.conn
            .query_row(
                "SELECT dot_number, fleet_size_bucket, peer_crash_percentile, peer_oos_percentile
                 FROM peer_benchmark WHERE dot_number = ?1",
                params![dot],
                peer_benchmark_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Most carriers insured first, then company name.
    pub fn insurance_company_stats(&self) -> EngineResult<Vec<InsuranceCompanyStats>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSURANCE_STATS_COLUMNS} FROM insurance_company_stats
             ORDER BY carriers_insured DESC, insurance_company ASC"
        ))?;
        let rows = stmt.query_map([], insurance_stats_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Lookup by company name, matched the way companies are grouped.
    pub fn insurance_company(&self, name: &str) -> EngineResult<Option<InsuranceCompanyStats>> {
        self.conn
            .query_row(
                &format!("SELECT {INSURANCE_STATS_COLUMNS} FROM insurance_company_stats WHERE insurance_company = ?1"),
                params![insurer_key(name)],
                insurance_stats_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    /// The most recently published run.
    pub fn latest_run(&self) -> EngineResult<Option<EngineRunRecord>> {
        self.conn
            .query_row(
                "SELECT run_id, as_of, rule_table_version, rule_table_fingerprint, carrier_count,
                        flagged_carriers, partial_evaluations, address_cluster_count,
                        identity_cluster_count, chameleon_pair_count, fraud_ring_count,
                        benchmarked_carriers, insurance_company_count, published_at
                 FROM engine_run ORDER BY rowid DESC LIMIT 1",
                [],
                engine_run_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn run_count(&self) -> EngineResult<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM engine_run", [], |r| r.get(0))?)
    }

    pub fn events_for_run(&self, run_id: &str) -> EngineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, seq, stage, event_type, payload
             FROM event_log WHERE run_id = ?1
             ORDER BY seq ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    seq: row.get(2)?,
                    stage: row.get(3)?,
                    event_type: row.get(4)?,
                    payload: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
