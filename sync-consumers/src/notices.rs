use std::collections::HashMap;
use sync_core::RequestStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeText {
    pub title: String,
    pub description: String,
}

impl NoticeText {
    fn new(title: &str, description: &str) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
        }
    }
}

/// Localized notice texts keyed by status string.
#[derive(Debug, Clone)]
pub struct NoticeCatalog {
    statuses: HashMap<String, NoticeText>,
    report_arrived: NoticeText,
    new_request: NoticeText,
}

impl NoticeCatalog {
    pub fn english() -> Self {
        let statuses = [
            (RequestStatus::Accepted, "Request accepted", "The provider accepted your request."),
            (RequestStatus::Rejected, "Request declined", "The provider declined your request."),
            (RequestStatus::InProgress, "Service started", "The provider has started working on your request."),
            (
                RequestStatus::AwaitingClientConfirmation,
                "Service finished",
                "The provider marked the service as done. Please review and confirm.",
            ),
            (RequestStatus::AwaitingPayment, "Awaiting payment", "The service was confirmed and is awaiting payment."),
            (RequestStatus::Completed, "Service completed", "The request is complete."),
            (RequestStatus::CancelledByClient, "Request cancelled", "The client cancelled the request."),
            (RequestStatus::CancelledByProvider, "Request cancelled", "The request was cancelled by the provider."),
        ];

        Self::from_entries(
            &statuses,
            NoticeText::new("Completion report received", "The provider sent a report for your request."),
            NoticeText::new("New request", "You received a new service request."),
        )
    }

    pub fn portuguese() -> Self {
        let statuses = [
            (RequestStatus::Accepted, "Solicitação aceita", "O prestador aceitou sua solicitação."),
            (RequestStatus::Rejected, "Solicitação recusada", "O prestador recusou sua solicitação."),
            (RequestStatus::InProgress, "Serviço iniciado", "O prestador começou a atender sua solicitação."),
            (
                RequestStatus::AwaitingClientConfirmation,
                "Serviço finalizado",
                "O prestador marcou o serviço como concluído. Revise e confirme.",
            ),
            (RequestStatus::AwaitingPayment, "Aguardando pagamento", "O serviço foi confirmado e aguarda pagamento."),
            (RequestStatus::Completed, "Serviço concluído", "A solicitação foi concluída."),
            (RequestStatus::CancelledByClient, "Solicitação cancelada", "O cliente cancelou a solicitação."),
            (RequestStatus::CancelledByProvider, "Solicitação cancelada", "A solicitação foi cancelada pelo prestador."),
        ];

        Self::from_entries(
            &statuses,
            NoticeText::new("Relatório recebido", "O prestador enviou o relatório da sua solicitação."),
            NoticeText::new("Nova solicitação", "Você recebeu uma nova solicitação de serviço."),
        )
    }

    fn from_entries(
        entries: &[(RequestStatus, &str, &str)],
        report_arrived: NoticeText,
        new_request: NoticeText,
    ) -> Self {
        let statuses = entries
            .iter()
            .map(|(status, title, description)| (status.as_str().to_string(), NoticeText::new(title, description)))
            .collect();
        Self {
            statuses,
            report_arrived,
            new_request,
        }
    }

    /// `None` for statuses without a notice, which are skipped silently.
    pub fn for_status(&self, status: RequestStatus) -> Option<&NoticeText> {
        self.statuses.get(status.as_str())
    }

    pub fn report_arrived(&self) -> &NoticeText {
        &self.report_arrived
    }

    pub fn new_request(&self) -> &NoticeText {
        &self.new_request
    }
}

impl Default for NoticeCatalog {
    fn default() -> Self {
        Self::english()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogs_cover_the_same_statuses() {
        let en = NoticeCatalog::english();
        let pt = NoticeCatalog::portuguese();
        for status in RequestStatus::ALL {
            assert_eq!(en.for_status(status).is_some(), pt.for_status(status).is_some(), "{status}");
        }
        assert_eq!(pt.for_status(RequestStatus::Accepted).unwrap().title, "Solicitação aceita");
    }

    #[test]
    fn test_pending_and_legacy_cancelled_are_unmapped() {
        let en = NoticeCatalog::english();
        assert!(en.for_status(RequestStatus::Pending).is_none());
        assert!(en.for_status(RequestStatus::Cancelled).is_none());
    }
}
