//! PCR reproduction over command logs recorded by real flow runs

mod common;

use bootflow::tpm::{replay_pcr, Command, CommandLogEntry, Preimage, SEPARATOR};
use bootflow::{run_flow, ArtifactKind, Digest, HashAlgorithm, Range, Register, RegisterId, SimulationConfig, Tpm};
use common::{init_logging, Platform, ACM_POLICY_STATUS};
use hex_literal::hex;
use pcr_reproduce::{reconcile, reproduce_pcr0, CorrectionTarget, NoSanitizer, ReplayIssue, ReproduceSettings};
use sha1::Digest as _;

const FLIPPED_BIT: usize = 12;

fn sha1(data: &[u8]) -> Digest {
    Digest::new(sha1::Sha1::digest(data).to_vec())
}

fn sha1_extend(pcr: &Digest, measurement: &Digest) -> Digest {
    let mut hasher = sha1::Sha1::new();
    hasher.update(pcr.as_bytes());
    hasher.update(measurement.as_bytes());
    Digest::new(hasher.finalize().to_vec())
}

fn separator_extend() -> CommandLogEntry {
    let mut entry = CommandLogEntry::new(Command::Extend {
        pcr: 0,
        algorithm: HashAlgorithm::Sha1,
        digest: sha1(&SEPARATOR),
    });
    entry.preimage = Some(Preimage {
        bytes: SEPARATOR.to_vec(),
        segments: vec![],
    });
    entry
}

/// Register snapshot that disagrees with the hardware in one bit
fn misread_platform() -> Platform {
    let mut platform = Platform::cbnt();
    platform.registers = vec![Register::from_u64(
        RegisterId::AcmPolicyStatus,
        ACM_POLICY_STATUS ^ (1 << FLIPPED_BIT),
    )];
    platform
}

fn register_search(parallel: bool) -> ReproduceSettings {
    ReproduceSettings {
        max_bit_distance: 1,
        correction: Some(CorrectionTarget::Artifact {
            artifact: ArtifactKind::Registers,
            range: Range::new(0, 8),
        }),
        parallel,
        ..Default::default()
    }
}

#[test]
fn test_separator_bit_flip() -> anyhow::Result<()> {
    init_logging();
    assert_eq!(sha1(&SEPARATOR).as_bytes(), hex!("9069ca78e7450a285173431b3e52c5c25299e473"));

    let log = vec![
        CommandLogEntry::new(Command::Init { locality: 0 }),
        separator_extend(),
        separator_extend(),
    ];
    let flipped: [u8; 4] = [0x08, 0x00, 0x00, 0x00];
    let zero = Digest::zero(20);
    let expected = sha1_extend(&sha1_extend(&zero, &sha1(&flipped)), &sha1(&SEPARATOR));

    let settings = ReproduceSettings {
        max_bit_distance: 1,
        max_disabled_measurements: 0,
        max_reorders: 0,
        localities: vec![],
        correction: Some(CorrectionTarget::Window {
            entry: 1,
            range: Range::new(0, 4),
        }),
        parallel: false,
    };
    let result = reproduce_pcr0(&log, HashAlgorithm::Sha1, &expected, &settings)?.expect("solution");
    let correction = result.correction.as_ref().expect("correction");
    assert_eq!(correction.flipped_bits, vec![3]);
    assert!(correction.flipped_bits.iter().all(|b| b / 8 == 0));
    assert_eq!(result.corrected_value(), Some(&flipped[..]));
    assert_eq!(result.correction_count(), 1);

    // only the first separator is corrected
    let commands = result.apply(&log)?;
    assert_eq!(commands[2], log[2].command);
    assert_eq!(replay_pcr(&commands, 0, HashAlgorithm::Sha1)?, expected);
    Ok(())
}

#[test]
fn test_recovers_acm_policy_status() -> anyhow::Result<()> {
    init_logging();
    let truth = run_flow(Platform::cbnt().state(), &SimulationConfig::default())?;
    let expected = truth.state.tpm().expect("tpm").pcr_value(0, HashAlgorithm::Sha256)?.clone();

    let recorded = run_flow(misread_platform().state(), &SimulationConfig::default())?;
    let tpm = recorded.state.tpm().expect("tpm");
    assert_ne!(tpm.pcr_value(0, HashAlgorithm::Sha256)?, &expected);

    let result = reproduce_pcr0(tpm.command_log(), HashAlgorithm::Sha256, &expected, &register_search(false))?
        .expect("solution");
    assert_eq!(result.locality, 3);
    assert!(result.disabled.is_empty());
    assert!(result.reorders.is_empty());
    let correction = result.correction.as_ref().expect("correction");
    assert_eq!(correction.flipped_bits, vec![FLIPPED_BIT]);
    assert_eq!(result.corrected_value(), Some(&ACM_POLICY_STATUS.to_le_bytes()[..]));

    let commands = result.apply(tpm.command_log())?;
    let replayed = Tpm::replay(tpm.supported_algorithms(), tpm.pcr_count(), &commands)?;
    assert_eq!(replayed.pcr_value(0, HashAlgorithm::Sha256)?, &expected);
    Ok(())
}

#[test]
fn test_parallel_search_matches_sequential() -> anyhow::Result<()> {
    let truth = run_flow(Platform::cbnt().state(), &SimulationConfig::default())?;
    let expected = truth.state.tpm().expect("tpm").pcr_value(0, HashAlgorithm::Sha1)?.clone();
    let recorded = run_flow(misread_platform().state(), &SimulationConfig::default())?;
    let log = recorded.state.tpm().expect("tpm").command_log();

    let sequential = reproduce_pcr0(log, HashAlgorithm::Sha1, &expected, &register_search(false))?;
    let parallel = reproduce_pcr0(log, HashAlgorithm::Sha1, &expected, &register_search(true))?;
    assert!(sequential.is_some());
    assert_eq!(sequential, parallel);
    Ok(())
}

#[test]
fn test_register_outside_preimages_is_rejected() -> anyhow::Result<()> {
    let result = run_flow(Platform::amd().state(), &SimulationConfig::default())?;
    let tpm = result.state.tpm().expect("tpm");
    let expected = tpm.pcr_value(0, HashAlgorithm::Sha256)?.clone();
    let err = reproduce_pcr0(tpm.command_log(), HashAlgorithm::Sha256, &expected, &register_search(false))
        .unwrap_err();
    assert!(err.to_string().contains("registers"));
    Ok(())
}

#[test]
fn test_reconcile_run_against_its_own_event_log() -> anyhow::Result<()> {
    init_logging();
    let result = run_flow(Platform::cbnt().state(), &SimulationConfig::default())?;
    let tpm = result.state.tpm().expect("tpm");

    for algorithm in [HashAlgorithm::Sha1, HashAlgorithm::Sha256] {
        let reconciled = reconcile(tpm.command_log(), tpm.event_log(), 0, algorithm, &NoSanitizer);
        assert!(reconciled.issues.is_empty(), "{:?}", reconciled.issues);
        assert_eq!(reconciled.entries[0].command, Command::Init { locality: 3 });
        // recorded entries survive with their causes
        assert!(reconciled.entries[1..].iter().all(|e| e.cause.is_some()));
        assert_eq!(replay_pcr(reconciled.commands(), 0, algorithm)?, *tpm.pcr_value(0, algorithm)?);
    }

    // an event log missing the DXE measurement
    let dxe = tpm
        .event_log()
        .iter()
        .position(|e| e.pcr == 0 && e.algorithm == HashAlgorithm::Sha256 && e.data == b"DXE firmware volume")
        .expect("dxe event");
    let mut truncated = tpm.event_log().to_vec();
    truncated.remove(dxe);
    let reconciled = reconcile(tpm.command_log(), &truncated, 0, HashAlgorithm::Sha256, &NoSanitizer);
    assert!(matches!(
        reconciled.issues.as_slice(),
        [ReplayIssue::MissingInEventLog { .. }]
    ));
    Ok(())
}
