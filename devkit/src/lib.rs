/*!
Devkit pour le cache d'inventaire VMForge

Facilite l'écriture de tests de scénario avec:
- Un faux vCenter scriptable (inventaire de labo, pannes, latence, compteurs d'appels)
- Un harness qui monte un `InventoryCache` complet et enregistre ses événements
- Des attentes asynchrones bornées (événements, conditions)
*/

pub mod fake_vcenter;
pub mod harness;

pub use fake_vcenter::{FakeCall, FakeVCenter};
pub use harness::{HarnessBuilder, TestHarness};
